pub mod dockerfile;
pub mod path_validator;
pub mod template;
pub mod toml;
