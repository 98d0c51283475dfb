pub mod device;
pub mod error;

pub use device::{BlockDevice, CrashDevice, FileDevice, MemoryDevice};
pub use error::{JournalError, Result};
