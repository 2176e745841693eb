pub mod error;
pub mod result;

pub trait AddMsg<S: Into<String>> {
    fn add_msg(self, msg: S) -> Self;
}

pub trait AddFnName<S: Into<String>> {
    fn add_fn_name(self, fn_name: S) -> Self;
}
