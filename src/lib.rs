pub mod core;
pub mod recorder;
pub mod shared;

pub use crate::core::logging::init_logging;
pub use crate::core::settings::{load_settings, RecorderSettings};
pub use recorder::{Destination, RecorderOptions, ScreenRecorder};
