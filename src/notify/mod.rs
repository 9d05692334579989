mod center;
mod debounce;
mod item;
mod read_state;

pub use center::{NotificationCenter, NotificationSource};
pub use debounce::Debouncer;
pub use item::{NotificationId, NotificationItem, NotificationKind, Priority};
pub use read_state::{FileStorage, KeyValueStorage, MemoryStorage, ReadSet};
