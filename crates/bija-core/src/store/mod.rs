pub mod db;
pub mod notices;

pub use db::Database;
pub use notices::NoticeQueue;
