pub mod attendance;
pub mod backup_exchange;
pub mod birthdays;
pub mod classes;
pub mod core;
pub mod fees;
pub mod payments;
pub mod students;
