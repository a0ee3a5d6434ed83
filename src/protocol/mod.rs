pub mod command;
pub mod frame;

pub use command::{Command, LookupType};
pub use frame::{Frame, FrameCodec, MAX_FRAME_SIZE};
