// Stage Events
// Messages pipeline components send to the supervisor

use tokio::sync::mpsc;

use crate::models::Scene;

/// What happened inside a component
#[derive(Debug, Clone, PartialEq)]
pub enum StageEventKind {
    /// RTMP write/connect failure reported on the encoder's stderr
    EncoderTransport(String),
    /// The encoder process went away
    EncoderExited {
        code: Option<i32>,
        detail: Option<String>,
    },
    /// The captured page looks crashed or blank
    CaptureError(String),
    /// Browser process exited or the DevTools socket dropped
    BrowserDisconnected(String),
    /// The director switched scenes
    SceneChanged(Scene),
}

/// Event tagged with the pipeline generation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub generation: u64,
    pub kind: StageEventKind,
}

pub type StageEventReceiver = mpsc::UnboundedReceiver<StageEvent>;

/// Sender handed to every component of one pipeline generation
#[derive(Debug, Clone)]
pub struct StageEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<StageEvent>,
}

impl StageEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<StageEvent>) -> Self {
        Self { generation, tx }
    }

    /// A detached sender plus its receiver, generation 0
    pub fn channel() -> (Self, StageEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(0, tx), rx)
    }

    /// Same channel, different generation
    pub fn for_generation(&self, generation: u64) -> Self {
        Self::new(generation, self.tx.clone())
    }

    /// Send an event; a closed supervisor just drops it
    pub fn emit(&self, kind: StageEventKind) {
        let _ = self.tx.send(StageEvent {
            generation: self.generation,
            kind,
        });
    }
}
