pub mod key_record;
pub mod note;
pub mod private_message;
pub mod profile;
pub mod tag_utils;
pub mod thread;

pub use key_record::KeyRecord;
pub use note::{AuthorSummary, Note, NoteView};
pub use private_message::{ConversationSummary, MessageView, PrivateMessage, UNREADABLE_MESSAGE};
pub use profile::{Profile, ProfileSummary, ProfileUpdate};
pub use thread::{Thread, ThreadEntry, ThreadedNotes};
