//! Repository layer for database access.

pub mod memory;
pub mod notification;
pub mod template;

pub use memory::MemoryNotificationRepository;
pub use notification::{
    NotificationRepository, ResponseStats, SqlxNotificationRepository, StatusChange,
};
pub use template::{MemoryTemplateRepository, SqlxTemplateRepository, TemplateRepository};
