// SmartESC serial link
//
// Provides:
// - Frame codec (encode host frames, decode ESC replies, additive checksum)
// - Frame receiver (buffered multi-frame parsing across reads)
// - Command sequencer (bring-up and run-cycle state machine)
// - Transport contract and serial implementation

pub mod protocol;
pub mod receiver;
pub mod sequencer;
pub mod transport;

pub use protocol::{Command, EscState, Frame, FrameError, ParsedFrame, Register, RegisterValue};
pub use receiver::FrameReceiver;
pub use sequencer::{FaultSignaled, Sequencer, SequencerConfig, SequencerState};
pub use transport::{EscError, SerialTransport, Transport};
