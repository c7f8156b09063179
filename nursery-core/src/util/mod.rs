/// Mocks and sample records shared by unit and integration tests
#[cfg(any(test, feature = "test_utils"))]
#[allow(missing_docs)]
pub mod test_utils;
