// ── Wire frame model ──
//
// Every frame on a tier connection is a JSON object with a `control`
// discriminant. Payload fields of `data` frames are application-defined;
// the transport strips `control` before delivery. Unknown control values
// and malformed JSON are logged and dropped without killing the
// connection, so mismatched protocol versions degrade instead of failing.

use serde_json::{Map, Value};

/// A wire frame: a JSON object, usually carrying a `control` field.
pub type Frame = Map<String, Value>;

/// Key of the control discriminant in every frame.
pub const CONTROL_KEY: &str = "control";

/// Control values defined by the tier connection protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// One-time pairing bootstrap (server role, pre-auth).
    SetAuthToken,
    /// Pairing accepted.
    AuthTokenOk,
    /// Pairing rejected (a token is already configured).
    AuthTokenError,
    /// Session authentication (client→server, pre-auth).
    Auth,
    /// Application payload.
    Data,
    /// Graceful session shutdown request.
    Close,
}

impl Control {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetAuthToken => "set-auth-token",
            Self::AuthTokenOk => "auth-token-ok",
            Self::AuthTokenError => "auth-token-error",
            Self::Auth => "auth",
            Self::Data => "data",
            Self::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "set-auth-token" => Some(Self::SetAuthToken),
            "auth-token-ok" => Some(Self::AuthTokenOk),
            "auth-token-error" => Some(Self::AuthTokenError),
            "auth" => Some(Self::Auth),
            "data" => Some(Self::Data),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

/// Parse an inbound text frame. Returns `None` (after logging) on
/// anything that is not a JSON object — the connection stays open.
pub fn parse_frame(text: &str) -> Option<Frame> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        Ok(other) => {
            tracing::warn!(kind = %json_kind(&other), "dropping non-object wire frame");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed wire frame");
            None
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The frame's control discriminant, if it carries a known one.
pub fn control_of(frame: &Frame) -> Option<Control> {
    frame
        .get(CONTROL_KEY)
        .and_then(Value::as_str)
        .and_then(Control::parse)
}

/// The raw control string, for logging unknown values.
pub fn raw_control(frame: &Frame) -> Option<&str> {
    frame.get(CONTROL_KEY).and_then(Value::as_str)
}

/// Tag an outbound frame as `data` if it has no control field.
/// Applied at send and at buffer-flush time.
pub fn tag_data(frame: &mut Frame) {
    if !frame.contains_key(CONTROL_KEY) {
        frame.insert(CONTROL_KEY.into(), Value::String(Control::Data.as_str().into()));
    }
}

/// Strip the control key before handing a `data` payload to the
/// application layer.
pub fn strip_control(mut frame: Frame) -> Frame {
    frame.remove(CONTROL_KEY);
    frame
}

pub fn serialize(frame: &Frame) -> String {
    Value::Object(frame.clone()).to_string()
}

// ── Frame constructors ───────────────────────────────────────────────

fn control_frame(control: Control) -> Frame {
    let mut f = Frame::new();
    f.insert(CONTROL_KEY.into(), Value::String(control.as_str().into()));
    f
}

pub fn auth_frame(identity: &str, token: &str) -> Frame {
    let mut f = control_frame(Control::Auth);
    f.insert("identity".into(), Value::String(identity.into()));
    f.insert("token".into(), Value::String(token.into()));
    f
}

pub fn set_auth_token_frame(token: &str) -> Frame {
    let mut f = control_frame(Control::SetAuthToken);
    f.insert("token".into(), Value::String(token.into()));
    f
}

pub fn auth_token_ok_frame() -> Frame {
    control_frame(Control::AuthTokenOk)
}

pub fn auth_token_error_frame() -> Frame {
    control_frame(Control::AuthTokenError)
}

pub fn close_frame() -> Frame {
    control_frame(Control::Close)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Frame {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parse_rejects_malformed_json() {
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame("[1, 2, 3]").is_none());
        assert!(parse_frame("\"just a string\"").is_none());
    }

    #[test]
    fn parse_accepts_objects() {
        let f = parse_frame(r#"{"control":"data","x":1}"#).unwrap();
        assert_eq!(control_of(&f), Some(Control::Data));
        assert_eq!(f["x"], 1);
    }

    #[test]
    fn unknown_control_is_not_a_known_value() {
        let f = obj(json!({"control": "frobnicate"}));
        assert_eq!(control_of(&f), None);
        assert_eq!(raw_control(&f), Some("frobnicate"));
    }

    #[test]
    fn tag_data_only_when_untagged() {
        let mut f = obj(json!({"x": 1}));
        tag_data(&mut f);
        assert_eq!(control_of(&f), Some(Control::Data));

        let mut f = obj(json!({"control": "close"}));
        tag_data(&mut f);
        assert_eq!(control_of(&f), Some(Control::Close));
    }

    #[test]
    fn strip_control_removes_only_the_discriminant() {
        let f = obj(json!({"control": "data", "x": 1, "y": "two"}));
        let stripped = strip_control(f);
        assert!(!stripped.contains_key(CONTROL_KEY));
        assert_eq!(stripped["x"], 1);
        assert_eq!(stripped["y"], "two");
    }

    #[test]
    fn auth_frame_shape() {
        let f = auth_frame("phone", "s3cret");
        assert_eq!(control_of(&f), Some(Control::Auth));
        assert_eq!(f["identity"], "phone");
        assert_eq!(f["token"], "s3cret");
    }

    #[test]
    fn control_round_trips() {
        for c in [
            Control::SetAuthToken,
            Control::AuthTokenOk,
            Control::AuthTokenError,
            Control::Auth,
            Control::Data,
            Control::Close,
        ] {
            assert_eq!(Control::parse(c.as_str()), Some(c));
        }
    }
}
