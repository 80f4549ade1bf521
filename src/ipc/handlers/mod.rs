pub mod attendance;
pub mod classes;
pub mod core;
pub mod faculty;
pub mod students;
pub mod subjects;
