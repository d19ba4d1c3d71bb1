pub mod capture_cmd;
pub mod tools_cmd;
