pub mod password;
pub mod token;

pub use password::{validate_password_plaintext, Password, PasswordError};
pub use token::{
    generate_token, hash_plaintext, validate_plaintext, Scope, Token, TokenError, TokenService,
    PLAINTEXT_LEN,
};
