pub mod command;
pub mod probe;
pub mod split;

pub use command::{CommandOutput, CommandRunner, MediaTools, SystemCommandRunner};
pub use probe::{DurationProber, MediaDuration, ProbeStrategy};
pub use split::Segmenter;
