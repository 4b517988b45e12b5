pub mod password;
pub mod random;
pub mod validation;

pub use password::{burn_verification, hash_password, verify_password};
pub use random::{numeric_code, random_token};
pub use validation::ValidatedJson;
