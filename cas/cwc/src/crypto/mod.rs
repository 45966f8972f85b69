mod link;
mod md5crypt;

pub use self::link::{LinkKey, spread_key};
pub use self::md5crypt::{CWC_SALT, md5_crypt};
