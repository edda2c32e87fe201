/*!
# ShieldDrone DevKit - Fakes and helpers for relay development

Runs a complete relay without a broker, a backend or a paired watch:
- `RecordingSink`: UI sink that remembers every alert and notice
- `MessageBuilder` / `AssignmentBuilder`: envelopes and raw wire JSON
- `TestHarness`: relay over the in-memory link, store and clock
*/

pub mod builders;
pub mod recording_sink;
pub mod test_utils;

pub use builders::{AssignmentBuilder, MessageBuilder};
pub use recording_sink::{RecordingSink, SinkEvent};
pub use test_utils::TestHarness;
