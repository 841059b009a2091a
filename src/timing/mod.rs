mod cursor;
mod scheduler;

pub use cursor::PlaybackCursor;
pub use scheduler::Schedule;
