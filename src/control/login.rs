//! Login handshake packets.
//!
//! The client authenticates with a short-lived auth code obtained out of
//! band. A successful reply carries the persona's identity; anything else
//! is a failed login.
//!
//! # Example
//!
//! ```
//! use blaze_client::control::{login_packet, Session};
//! use blaze_client::protocol::{methods, body, Packet, PacketKind};
//! use serde_json::json;
//!
//! let request = login_packet("auth-code");
//! assert_eq!(request.method, methods::LOGIN);
//!
//! let reply = Packet::reply_to(&request, PacketKind::Result, body([
//!     ("DSNM", json!("Player")),
//!     ("PID", json!(1001)),
//!     ("UID", json!(2002)),
//!     ("CGID", json!([30, 1, 3003])),
//! ]));
//! let session = Session::from_login_reply(&reply).unwrap();
//! assert_eq!(session.client_group_id, 3003);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BlazeError, Result};
use crate::protocol::{body, methods, Packet};

/// Build the login command for an auth code.
pub fn login_packet(auth_code: &str) -> Packet {
    Packet::command(
        methods::LOGIN,
        body([
            ("AUTH", json!(auth_code)),
            ("EXTB", json!("")),
            ("EXTI", json!(0)),
        ]),
    )
}

/// Identity of an authenticated persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Display name.
    pub display_name: String,
    /// Persona id.
    pub persona_id: u64,
    /// User id.
    pub user_id: u64,
    /// Third element of the client group triple.
    pub client_group_id: u64,
}

#[derive(Deserialize)]
struct LoginReply {
    #[serde(rename = "DSNM")]
    display_name: String,
    #[serde(rename = "PID")]
    persona_id: u64,
    #[serde(rename = "UID")]
    user_id: u64,
    #[serde(rename = "CGID")]
    client_group: Vec<Value>,
}

impl Session {
    /// Extract the session from a login reply.
    ///
    /// # Errors
    ///
    /// `Authentication` if the reply is an error or lacks any identity field.
    pub fn from_login_reply(reply: &Packet) -> Result<Self> {
        if reply.error_code != 0 {
            return Err(BlazeError::Authentication(format!(
                "Login rejected with error code {:#06x}",
                reply.error_code
            )));
        }

        let parsed: LoginReply = serde_json::from_value(Value::Object(reply.body.clone()))
            .map_err(|e| BlazeError::Authentication(format!("Incomplete login reply: {e}")))?;

        let client_group_id = parsed
            .client_group
            .get(2)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                BlazeError::Authentication("Login reply has no client group id".to_string())
            })?;

        Ok(Self {
            display_name: parsed.display_name,
            persona_id: parsed.persona_id,
            user_id: parsed.user_id,
            client_group_id,
        })
    }
}
