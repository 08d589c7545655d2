#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// Usage, configuration or setup error; nothing ran.
    InvalidInput = 1,

    /// The run completed but is tainted (failed threshold or iteration
    /// errors).
    Tainted = 99,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
