pub mod settings;

pub mod compiler_messages;

pub mod backends;

pub mod ir_script;

pub mod projects;
