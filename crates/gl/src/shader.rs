// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use crate::{Error, Result};
use vidpresent_frame::GlApi;

/// Attribute location of the vertex position.
pub const ATTRIB_POS: u32 = 0;
/// Attribute location of the texture coordinate.
pub const ATTRIB_TEX: u32 = 1;
/// Name of the fragment shader output.
pub const FRAG_OUTPUT: &str = "color";

/// Sampler uniforms, one per plane.
pub const FRAME_UNIFORMS: [&str; 3] = ["frame", "frame_u", "frame_v"];
pub const COLORMATRIX_UNIFORM: &str = "colormatrix";
pub const COLOROFFSET_UNIFORM: &str = "coloroffset";

/// Which fragment shader a program needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProgramSpec {
    /// Sample Y, U and V from separate textures.
    pub planar: bool,
    /// Apply `colormatrix` and `coloroffset` to the sampled colour.
    pub colormatrix: bool,
    /// Sample an EGL image bound as `samplerExternalOES`.
    pub external: bool,
}

/// GLSL flavour of one API.
pub trait ShaderDialect {
    fn api(&self) -> GlApi;

    /// `#version` line, the first line of every shader.
    fn version(&self) -> &'static str;

    /// Default precision statements following the directives.
    fn precision(&self) -> &'static str;

    /// Extra preamble of fragment shaders sampling external images, `None`
    /// when the dialect has no external samplers.
    fn external_header(&self) -> Option<&'static str>;

    /// The output location has to be bound before linking instead of
    /// declared in the source.
    fn binds_frag_data_location(&self) -> bool;
}

pub struct DesktopGl;

impl ShaderDialect for DesktopGl {
    fn api(&self) -> GlApi {
        GlApi::Gl
    }

    fn version(&self) -> &'static str {
        "#version 140\n"
    }

    fn precision(&self) -> &'static str {
        ""
    }

    fn external_header(&self) -> Option<&'static str> {
        None
    }

    fn binds_frag_data_location(&self) -> bool {
        true
    }
}

pub struct EmbeddedGl;

impl ShaderDialect for EmbeddedGl {
    fn api(&self) -> GlApi {
        GlApi::Gles
    }

    fn version(&self) -> &'static str {
        "#version 300 es\n"
    }

    fn precision(&self) -> &'static str {
        "precision mediump float;\n"
    }

    fn external_header(&self) -> Option<&'static str> {
        Some("#extension GL_OES_EGL_image_external_essl3 : require\n")
    }

    fn binds_frag_data_location(&self) -> bool {
        false
    }
}

/// The dialect used for `api`.
pub fn dialect(api: GlApi) -> &'static dyn ShaderDialect {
    match api {
        GlApi::Gl => &DesktopGl,
        GlApi::Gles => &EmbeddedGl,
    }
}

const VERTEX_BODY: &str = "
in vec2 pos;
in vec2 tex;
out vec2 tc;

void main() {
    tc = tex;
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

const SAMPLE_PACKED: &str = "
    vec4 c = texture(frame, tc);
";

const SAMPLE_PLANAR: &str = "
    vec4 c = vec4(texture(frame, tc).r, texture(frame_u, tc).r, texture(frame_v, tc).r, 1.0);
";

const APPLY_COLORMATRIX: &str = "
    c = colormatrix * c + coloroffset;
";

/// Vertex and fragment source of one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource {
    pub api: GlApi,
    pub spec: ProgramSpec,
    pub vertex: String,
    pub fragment: String,
    /// Bind [`FRAG_OUTPUT`] to location 0 before linking.
    pub bind_frag_data: bool,
}

impl ProgramSource {
    pub fn new(dialect: &dyn ShaderDialect, spec: ProgramSpec) -> Result<Self> {
        let external_header = if spec.external {
            if spec.planar {
                return Err(Error::NotSupported(
                    "planar sampling of external images".to_owned(),
                ));
            }
            dialect.external_header().ok_or_else(|| {
                Error::NotSupported(format!(
                    "external samplers with {:?} shaders",
                    dialect.api()
                ))
            })?
        } else {
            ""
        };

        let vertex = format!("{}{}{VERTEX_BODY}", dialect.version(), dialect.precision());

        let sampler = if spec.external {
            "samplerExternalOES"
        } else {
            "sampler2D"
        };
        // extension directives must precede the first statement
        let mut fragment = format!(
            "{}{external_header}{}\n",
            dialect.version(),
            dialect.precision()
        );
        let planes = if spec.planar { 3 } else { 1 };
        for name in FRAME_UNIFORMS.iter().take(planes) {
            fragment.push_str(&format!("uniform {sampler} {name};\n"));
        }
        if spec.colormatrix {
            fragment.push_str(&format!(
                "uniform mat4 {COLORMATRIX_UNIFORM};\nuniform vec4 {COLOROFFSET_UNIFORM};\n"
            ));
        }
        fragment.push_str(&format!("in vec2 tc;\nout vec4 {FRAG_OUTPUT};\n\nvoid main() {{"));
        fragment.push_str(if spec.planar {
            SAMPLE_PLANAR
        } else {
            SAMPLE_PACKED
        });
        if spec.colormatrix {
            fragment.push_str(APPLY_COLORMATRIX);
        }
        fragment.push_str(&format!("    {FRAG_OUTPUT} = c;\n}}\n"));

        Ok(Self {
            api: dialect.api(),
            spec,
            vertex,
            fragment,
            bind_frag_data: dialect.binds_frag_data_location(),
        })
    }
}

/// Uniform locations resolved after linking, -1 when the program does not
/// use the uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocations {
    pub frames: [i32; 3],
    pub colormatrix: i32,
    pub coloroffset: i32,
}

impl Default for UniformLocations {
    fn default() -> Self {
        Self {
            frames: [-1; 3],
            colormatrix: -1,
            coloroffset: -1,
        }
    }
}

/// A linked program of one API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub id: u32,
    pub api: GlApi,
    pub spec: ProgramSpec,
    pub uniforms: UniformLocations,
}

#[cfg(test)]
mod shader_tests {
    use super::*;

    #[test]
    fn test_gles_source() {
        let source = ProgramSource::new(
            &EmbeddedGl,
            ProgramSpec {
                planar: true,
                colormatrix: true,
                external: false,
            },
        )
        .unwrap();
        assert!(source.vertex.starts_with("#version 300 es\nprecision mediump float;\n"));
        assert!(source.fragment.starts_with("#version 300 es\nprecision mediump float;\n"));
        assert!(source.fragment.contains("uniform sampler2D frame_v;"));
        assert!(source.fragment.contains("colormatrix * c + coloroffset"));
        assert!(!source.bind_frag_data);
    }

    #[test]
    fn test_gl_source() {
        let source = ProgramSource::new(&DesktopGl, ProgramSpec::default()).unwrap();
        assert!(source.vertex.starts_with("#version 140\n"));
        assert!(source.fragment.contains("uniform sampler2D frame;"));
        assert!(!source.fragment.contains("frame_u"));
        assert!(!source.fragment.contains("colormatrix"));
        assert!(source.bind_frag_data);
    }

    #[test]
    fn test_external_sampler() {
        let spec = ProgramSpec {
            planar: false,
            colormatrix: false,
            external: true,
        };
        let source = ProgramSource::new(&EmbeddedGl, spec).unwrap();
        assert!(source.fragment.contains("GL_OES_EGL_image_external_essl3"));
        assert!(source.fragment.contains("uniform samplerExternalOES frame;"));
        assert!(source.fragment.starts_with(
            "#version 300 es\n#extension GL_OES_EGL_image_external_essl3 : require\nprecision mediump float;\n"
        ));

        assert!(matches!(
            ProgramSource::new(&DesktopGl, spec),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_dialect_by_api() {
        assert_eq!(dialect(GlApi::Gl).api(), GlApi::Gl);
        assert_eq!(dialect(GlApi::Gles).api(), GlApi::Gles);
    }
}
