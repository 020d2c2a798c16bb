// Pagecast Services
// Pipeline components and the supervisor that drives them

mod audio_resolver;
pub mod capture;
pub mod cdp;
mod destination_registry;
pub mod diagnostics;
pub mod director;
pub mod encoder_probe;
mod events;
pub mod ffmpeg_pipeline;
mod launcher;
mod stages;
mod streamer;

pub use audio_resolver::*;
pub use capture::{CaptureError, CaptureSource};
pub use destination_registry::*;
pub use director::Director;
pub use events::*;
pub use ffmpeg_pipeline::{FfmpegPipeline, PipelineError};
pub use launcher::*;
pub use stages::*;
pub use streamer::*;
