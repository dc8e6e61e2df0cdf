//! Focal length derivation and Astrometrica configuration synthesis.

use std::path::{Path, PathBuf};
use thiserror::Error;

use super::extract::SolverResult;

/// Arcseconds per radian.
pub const ARCSEC_PER_RADIAN: f64 = 206265.0;

/// Detector pixel pitch in millimetres.
pub const PIXEL_PITCH_MM: f64 = 0.03;

pub const FOCAL_LENGTH_MARKER: &str = "FocalLength";
pub const POSITION_ANGLE_MARKER: &str = "PA";
/// Lines containing this are never rewritten even though they contain `PA`.
pub const POSITION_ANGLE_GUARD: &str = "VarPA";

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("pixel scale missing from solver output")]
    MissingPixelScale,

    #[error("invalid pixel scale {0:?}")]
    InvalidPixelScale(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Plate scale to focal length for the fixed pixel pitch.
pub fn determine_focal_length(result: &SolverResult) -> Result<f64, SynthesisError> {
    let raw = result
        .pixel_scale
        .as_deref()
        .ok_or(SynthesisError::MissingPixelScale)?;
    let pixel_scale: f64 = raw
        .parse()
        .map_err(|_| SynthesisError::InvalidPixelScale(raw.to_string()))?;
    if !pixel_scale.is_finite() || pixel_scale <= 0.0 {
        return Err(SynthesisError::InvalidPixelScale(raw.to_string()));
    }
    Ok(ARCSEC_PER_RADIAN * PIXEL_PITCH_MM / pixel_scale)
}

/// Decimal rendering with at most six fractional digits, trailing zeros trimmed.
pub fn format_focal_length(value: f64) -> String {
    let fixed = format!("{:.6}", value);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

/// Substitute the markers of `template`, line by line.
///
/// A line containing `FocalLength` becomes `FocalLength=<focal_length>`; a
/// line containing `PA` but not `VarPA` becomes `PA=<rotation>` when a
/// rotation is known. Everything else, line endings included, is copied.
pub fn set_new_cfg_headers(template: &str, focal_length: &str, rotation: Option<&str>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    for line in template.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];

        if body.contains(FOCAL_LENGTH_MARKER) {
            out.push_str(FOCAL_LENGTH_MARKER);
            out.push('=');
            out.push_str(focal_length);
            out.push_str(ending);
        } else if body.contains(POSITION_ANGLE_MARKER) && !body.contains(POSITION_ANGLE_GUARD) {
            match rotation {
                Some(rotation) => {
                    out.push_str(POSITION_ANGLE_MARKER);
                    out.push('=');
                    out.push_str(rotation);
                    out.push_str(ending);
                }
                None => out.push_str(line),
            }
        } else {
            out.push_str(line);
        }
    }
    out
}

/// A generated configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct OpticalConfig {
    pub focal_length_mm: f64,
    pub field_rotation: Option<String>,
    pub path: PathBuf,
}

/// Renders per-image configuration files from a template.
#[derive(Debug, Clone)]
pub struct ConfigSynthesizer {
    template: String,
    output_dir: PathBuf,
}

impl ConfigSynthesizer {
    pub fn new(template: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Load the template from disk.
    pub async fn from_template_file(
        template_path: &Path,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, SynthesisError> {
        let template = tokio::fs::read_to_string(template_path)
            .await
            .map_err(|source| SynthesisError::Io {
                path: template_path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(template, output_dir))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<output_dir>/<image stem>.cfg`
    pub fn config_path(&self, image: &str) -> PathBuf {
        let stem = Path::new(image)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.to_string());
        self.output_dir.join(format!("{}.cfg", stem))
    }

    /// Render the configuration text for a solved image.
    pub fn render(&self, result: &SolverResult) -> Result<(f64, String), SynthesisError> {
        let focal_length = determine_focal_length(result)?;
        let text = set_new_cfg_headers(
            &self.template,
            &format_focal_length(focal_length),
            result.field_rotation.as_deref(),
        );
        Ok((focal_length, text))
    }

    /// Derive the focal length and write the configuration file for `image`.
    pub async fn synthesize(
        &self,
        image: &str,
        result: &SolverResult,
    ) -> Result<OpticalConfig, SynthesisError> {
        let (focal_length_mm, text) = self.render(result)?;
        if result.field_rotation.is_none() {
            tracing::warn!("No field rotation for {}, PA left as in template", image);
        }

        let path = self.config_path(image);
        tokio::fs::write(&path, text)
            .await
            .map_err(|source| SynthesisError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!("Wrote {} (FocalLength={:.3})", path.display(), focal_length_mm);

        Ok(OpticalConfig {
            focal_length_mm,
            field_rotation: result.field_rotation.clone(),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn solved(pixel_scale: &str, rotation: &str) -> SolverResult {
        SolverResult {
            pixel_scale: Some(pixel_scale.to_string()),
            field_rotation: Some(rotation.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_focal_length_from_pixel_scale() {
        let focal = determine_focal_length(&solved("2.05136", "0")).unwrap();
        assert!((focal - 3016.56).abs() < 0.01, "got {}", focal);
    }

    #[test]
    fn test_focal_length_requires_pixel_scale() {
        let result = SolverResult::default();
        assert!(matches!(
            determine_focal_length(&result),
            Err(SynthesisError::MissingPixelScale)
        ));

        for bad in ["abc", "0", "-1.5", "inf"] {
            assert!(matches!(
                determine_focal_length(&solved(bad, "0")),
                Err(SynthesisError::InvalidPixelScale(_))
            ));
        }
    }

    #[test]
    fn test_format_focal_length() {
        assert_eq!(format_focal_length(3093.975), "3093.975");
        assert_eq!(format_focal_length(3000.0), "3000");
        assert_eq!(format_focal_length(206265.0 * 0.03 / 2.0), "3093.975");
    }

    #[test]
    fn test_template_substitution_respects_guard() {
        let synth = ConfigSynthesizer::new("FocalLength=0\nPA=0\nVarPA=0\n", "/tmp");
        let (_, text) = synth.render(&solved("2.0", "10.5")).unwrap();

        let lines: Vec<_> = text.split_inclusive('\n').collect();
        assert_eq!(lines, vec!["FocalLength=3093.975\n", "PA=10.5\n", "VarPA=0\n"]);
    }

    #[test]
    fn test_template_keeps_other_lines_and_endings() {
        let template = "[Telescope]\r\nFocalLength = 1200\r\nPixelWidth=9\r\nPA=0\r\nVarPA=1\r\nLast";
        let text = set_new_cfg_headers(template, "3000", Some("-152.913"));
        assert_eq!(
            text,
            "[Telescope]\r\nFocalLength=3000\r\nPixelWidth=9\r\nPA=-152.913\r\nVarPA=1\r\nLast"
        );
    }

    #[test]
    fn test_missing_rotation_leaves_pa_line() {
        let text = set_new_cfg_headers("FocalLength=0\nPA=0\n", "100", None);
        assert_eq!(text, "FocalLength=100\nPA=0\n");
    }

    #[tokio::test]
    async fn test_synthesize_writes_cfg_named_after_image() {
        let dir = TempDir::new().unwrap();
        let synth = ConfigSynthesizer::new("FocalLength=0\nPA=0\nVarPA=0\n", dir.path());

        let config = synth
            .synthesize("Briol_TA_FITS.fit", &solved("2.0", "10.5"))
            .await
            .unwrap();

        assert_eq!(config.path, dir.path().join("Briol_TA_FITS.cfg"));
        assert_eq!(config.field_rotation.as_deref(), Some("10.5"));
        assert!((config.focal_length_mm - 3093.975).abs() < 1e-9);
        assert_eq!(
            std::fs::read_to_string(&config.path).unwrap(),
            "FocalLength=3093.975\nPA=10.5\nVarPA=0\n"
        );
    }

    #[tokio::test]
    async fn test_synthesize_without_pixel_scale_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let synth = ConfigSynthesizer::new("FocalLength=0\n", dir.path());

        let result = SolverResult {
            field_rotation: Some("1".to_string()),
            ..Default::default()
        };
        assert!(synth.synthesize("a.fits", &result).await.is_err());
        assert!(!dir.path().join("a.cfg").exists());
    }
}
