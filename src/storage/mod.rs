pub mod cursor;

pub use cursor::{CursorError, CursorStore, FileCursor, Incarnation};
