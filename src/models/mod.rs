// Pagecast Models
// Data structures shared by the broadcast services

mod audio_source;
mod destination;
mod pipeline_config;
mod settings;
mod stream_stats;
mod streamer_state;

pub use audio_source::*;
pub use destination::*;
pub use pipeline_config::*;
pub use settings::*;
pub use stream_stats::*;
pub use streamer_state::*;
