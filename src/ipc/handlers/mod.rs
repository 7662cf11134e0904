pub mod affiliations;
pub mod assignments;
pub mod categories;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod forms;
pub mod logs;
pub mod profiles;
pub mod reports;
pub mod skills;
