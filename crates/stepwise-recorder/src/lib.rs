//! stepwise-recorder - Capture live interaction as replayable events
//!
//! Each observed click, input, key press, scroll or navigation is converted on
//! arrival into a [`RecordedEvent`] whose target is a robust
//! [`Locator`](stepwise_core::Locator), then buffered until the session stops.
//! Sessions can be saved as JSON lines with [`RecordingStorage`].

pub mod events;
pub mod recorder;
pub mod storage;

pub use events::*;
pub use recorder::{
    EventRecorder, EventSink, InteractionSource, Receiver, RecorderConfig, RecorderError,
    ScriptedSource, Sender,
};
pub use storage::RecordingStorage;

pub mod prelude {
    pub use crate::events::*;
    pub use crate::recorder::{EventRecorder, InteractionSource, RecorderConfig, ScriptedSource};
    pub use crate::storage::RecordingStorage;
}
