// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use log::trace;
use vidpresent_frame::Orientation;

/// Context of the output video state variables.
pub const OUTPUT_VIDEO_CTX: &str = "ov";

/// Value of a state variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl StateValue {
    fn as_f64(&self) -> Option<f64> {
        match *self {
            StateValue::Float(v) => Some(v),
            StateValue::Int(v) => Some(v as f64),
            StateValue::Bool(_) => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match *self {
            StateValue::Bool(v) => Some(v),
            StateValue::Int(v) => Some(v != 0),
            StateValue::Float(_) => None,
        }
    }
}

/// A state variable the output reacts to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    Contrast(f64),
    Saturation(f64),
    Brightness(f64),
    /// Percent.
    Zoom(f64),
    Squeeze(f64),
    Orientation(Orientation),
    Paused(bool),
}

impl StateChange {
    /// `None` for other contexts, unknown variables and values of the wrong
    /// type.
    pub fn parse(ctx: &str, var: &str, value: &StateValue) -> Option<StateChange> {
        if ctx != OUTPUT_VIDEO_CTX {
            return None;
        }
        let change = match var {
            "contrast" => StateChange::Contrast(value.as_f64()?),
            "saturation" => StateChange::Saturation(value.as_f64()?),
            "brightness" => StateChange::Brightness(value.as_f64()?),
            "zoom" => StateChange::Zoom(value.as_f64()?),
            "squeeze" => StateChange::Squeeze(value.as_f64()?),
            "orientation" => match value {
                StateValue::Int(v) => {
                    StateChange::Orientation(Orientation::from_index(u8::try_from(*v).ok()?)?)
                }
                _ => return None,
            },
            "paused" => StateChange::Paused(value.as_bool()?),
            _ => {
                trace!("ignoring state {ctx}/{var}");
                return None;
            }
        };
        Some(change)
    }
}
