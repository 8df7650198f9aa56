//! 内存模块 - 槽位布局与子表存储区

pub mod arena;
pub mod layout;

pub use arena::TableArena;
pub use layout::SlotLayout;
