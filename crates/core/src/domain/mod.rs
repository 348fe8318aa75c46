pub mod conversation;
pub mod tenant;
