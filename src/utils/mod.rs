pub mod http;
pub mod logging;
pub mod sse;
#[cfg(test)]
pub mod test_utils;
