pub mod oauth;
pub mod sms;

pub use oauth::{
    HttpTokenEndpoint, RefreshPolicy, TokenEndpoint, TokenError, TokenGrant, TokenInfo,
    TokenManager, TokenResponse,
};
pub use sms::{HttpSmsSender, SmsError, SmsReceipt, SmsSender};
