//! Typed rows and CRUD for the metadata store.
//!
//! Entities are independent rows joined by foreign keys; navigation is by
//! explicit query, never an in-memory graph of back-pointers.

pub mod file;
pub mod instance;
pub mod librarian;
pub mod log;
pub mod send_queue;
pub mod store;
pub mod transfer;
pub mod user;

pub use file::File;
pub use instance::{DeletionPolicy, Instance, RemoteInstance};
pub use librarian::Librarian;
pub use log::{log_error, BackgroundTaskRun, ErrorLogRow};
pub use send_queue::SendQueueItem;
pub use store::StoreRow;
pub use transfer::{IncomingTransfer, OutgoingTransfer};
pub use user::User;
