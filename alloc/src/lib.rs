//! FreeSpaceCore and ExtentRefModel.

pub mod extentref;
pub mod freespace;

pub use extentref::{Backref, BackrefTarget, ExtentRecord, ExtentRecordTemplate, ExtentRefModel};
pub use freespace::{EntryKind, FreeSpaceCore, FreeSpaceEntry};
