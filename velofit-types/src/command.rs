use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CamId;

/// Where a command is addressed.
///
/// The wire form is either a JSON integer (a camera id) or a string. String
/// targets of the form `cam_<n>` / `camera_<n>` or a bare number resolve to
/// a camera; every other string is a stage name or the `all`/`broadcast`
/// keyword and is fanned out to all workers for their engines to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    Camera(CamId),
    Named(String),
}

impl CommandTarget {
    pub fn parse(text: &str) -> CommandTarget {
        if let Some(id) = resolve_camera_id(text) {
            CommandTarget::Camera(id)
        } else {
            CommandTarget::Named(text.to_string())
        }
    }

    pub fn camera_id(&self) -> Option<CamId> {
        match self {
            CommandTarget::Camera(id) => Some(*id),
            CommandTarget::Named(_) => None,
        }
    }

    pub fn is_broadcast_keyword(&self) -> bool {
        matches!(self, CommandTarget::Named(name) if name == "all" || name == "broadcast")
    }
}

/// `cam_3`, `camera_3` and `"3"` all resolve to camera 3.
fn resolve_camera_id(target: &str) -> Option<CamId> {
    let tail = target
        .strip_prefix("camera_")
        .or_else(|| target.strip_prefix("cam_"))
        .unwrap_or(target);
    tail.parse::<u8>().ok().map(CamId)
}

impl std::fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CommandTarget::Camera(id) => write!(f, "camera_{id}"),
            CommandTarget::Named(name) => write!(f, "{name}"),
        }
    }
}

impl Serialize for CommandTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CommandTarget::Camera(id) => serializer.serialize_u8(id.0),
            CommandTarget::Named(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for CommandTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(i64),
            Text(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Num(n) => {
                let id = u8::try_from(n).map_err(serde::de::Error::custom)?;
                CommandTarget::Camera(CamId(id))
            }
            Repr::Text(text) => CommandTarget::parse(&text),
        })
    }
}

/// Client → endpoint → worker command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub target: CommandTarget,
    pub cmd: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl CommandEnvelope {
    pub fn new<C: Into<String>>(
        target: CommandTarget,
        cmd: C,
        args: serde_json::Value,
    ) -> Self {
        CommandEnvelope {
            target,
            cmd: cmd.into(),
            args,
        }
    }
}
