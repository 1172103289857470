use serde_json::Value;

use super::MailError;

pub const USER_WELCOME: &str = "user_welcome";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub subject: String,
    pub plain: String,
    pub html: String,
}

pub fn render(template: &str, data: &Value) -> Result<RenderedMail, MailError> {
    match template {
        USER_WELCOME => user_welcome(data),
        other => Err(MailError::UnknownTemplate(other.to_string())),
    }
}

fn field(data: &Value, template: &'static str, field: &'static str) -> Result<String, MailError> {
    match data.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(MailError::MissingField { template, field }),
    }
}

fn user_welcome(data: &Value) -> Result<RenderedMail, MailError> {
    let user_id = field(data, USER_WELCOME, "user_id")?;
    let token = field(data, USER_WELCOME, "activation_token")?;

    let subject = "Welcome to Comments!".to_string();
    let plain = format!(
        "Hi,\n\n\
         Thanks for signing up for a Comments account. Your user ID number is {user_id}.\n\n\
         Please send a request to the `PUT /v1/users/activated` endpoint with the following \
         JSON body to activate your account:\n\n\
         {{\"token\": \"{token}\"}}\n\n\
         Please note that this is a one-time use token and it will expire in 3 days.\n\n\
         Thanks,\n\nThe Comments Team\n"
    );
    let html = format!(
        "<!doctype html>\n<html>\n<head>\n\
         <meta name=\"viewport\" content=\"width=device-width\" />\n\
         <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\" />\n\
         </head>\n<body>\n\
         <p>Hi,</p>\n\
         <p>Thanks for signing up for a Comments account. Your user ID number is {user_id}.</p>\n\
         <p>Please send a request to the <code>PUT /v1/users/activated</code> endpoint with the \
         following JSON body to activate your account:</p>\n\
         <pre><code>{{\"token\": \"{token}\"}}</code></pre>\n\
         <p>Please note that this is a one-time use token and it will expire in 3 days.</p>\n\
         <p>Thanks,</p>\n<p>The Comments Team</p>\n\
         </body>\n</html>\n"
    );

    Ok(RenderedMail { subject, plain, html })
}
