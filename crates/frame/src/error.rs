// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    #[cfg(target_os = "linux")]
    NixError(nix::Error),
    NotImplemented(String),
    InvalidSize(usize),
    InvalidLayout(String),
    Allocation(String),
    UnsupportedFormat(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

#[cfg(target_os = "linux")]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::NixError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "IO error: {}", e),
            #[cfg(target_os = "linux")]
            Error::NixError(e) => write!(f, "Nix error: {}", e),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::InvalidSize(size) => write!(f, "Invalid size: {}", size),
            Error::InvalidLayout(msg) => write!(f, "Invalid frame layout: {}", msg),
            Error::Allocation(msg) => write!(f, "Buffer allocation failed: {}", msg),
            Error::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
