//! Reading solver results and turning them into Astrometrica configuration.

pub mod extract;
mod synth;

pub use extract::{read_capture, SolverResult};
pub use synth::{
    determine_focal_length, format_focal_length, set_new_cfg_headers, ConfigSynthesizer,
    OpticalConfig, SynthesisError, ARCSEC_PER_RADIAN, PIXEL_PITCH_MM,
};
