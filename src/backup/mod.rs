pub mod app_config;
pub mod archive;
pub mod batch;
pub mod cancel;
pub mod catalog;
pub mod compress;
pub mod encrypt;
pub mod file_ext;
pub mod finish;
pub mod logs;
pub mod notifications;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod schedule;
pub mod shell;
pub mod storage;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
