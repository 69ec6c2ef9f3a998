//! Anchor channel method dispatch.
//!
//! Maps loosely typed method calls (a method name plus a JSON argument map)
//! onto [`AnchorManager`] operations and shapes their responses.
//!
//! | method | arguments | response |
//! |---|---|---|
//! | `init` | | `null` |
//! | `addAnchor` | `type`, `transform`, `name` | `true` / `false` |
//! | `removeAnchor` | `name` | `null` |
//! | `initCloudMode`, `initGoogleCloudAnchorMode` | | `null` or error |
//! | `uploadAnchor` | `nodeName`, `ttl?` | `true` or error |
//! | `downloadAnchor` | `cloudanchorid` | `null` or error |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AnchorError, AnchorResult};
use crate::manager::AnchorManager;
use crate::types::{AnchorKind, Transform};

/// Typed anchor channel command.
#[derive(Debug, Clone, PartialEq)]
pub enum AnchorCommand {
    /// Channel handshake
    Init,
    /// Create a local anchor
    AddAnchor {
        /// Anchor type
        kind: AnchorKind,
        /// World pose
        transform: Transform,
        /// Caller-assigned name
        name: String,
    },
    /// Remove a local anchor
    RemoveAnchor {
        /// Anchor name
        name: String,
    },
    /// Enable cloud anchors
    InitCloudMode,
    /// Host a local anchor
    UploadAnchor {
        /// Anchor name
        name: String,
        /// Time-to-live in days
        ttl_days: Option<u32>,
    },
    /// Resolve a hosted anchor
    DownloadAnchor {
        /// Cloud identifier
        cloud_id: String,
    },
}

/// Reply to a method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodResponse {
    /// The call was handled
    Success {
        /// Result value
        value: Value,
    },
    /// The call failed
    Error {
        /// Machine-readable error code
        code: String,
        /// Human-readable description
        message: String,
    },
    /// No such method
    NotImplemented,
}

impl MethodResponse {
    /// Successful reply carrying `value`
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    /// Successful reply without a value
    pub fn null() -> Self {
        Self::Success { value: Value::Null }
    }
}

impl From<&AnchorError> for MethodResponse {
    fn from(err: &AnchorError) -> Self {
        MethodResponse::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl AnchorCommand {
    /// Parse a method call.
    ///
    /// Returns `Ok(None)` for unknown methods.
    pub fn parse(method: &str, args: &Value) -> AnchorResult<Option<Self>> {
        let command = match method {
            "init" => AnchorCommand::Init,
            "addAnchor" => {
                let code = args
                    .get("type")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| AnchorError::invalid("addAnchor needs an integer 'type'"))?;
                AnchorCommand::AddAnchor {
                    kind: AnchorKind::try_from(code)?,
                    transform: transform_arg(args)?,
                    name: string_arg(args, "name")?,
                }
            }
            "removeAnchor" => AnchorCommand::RemoveAnchor {
                name: string_arg(args, "name")?,
            },
            "initCloudMode" | "initGoogleCloudAnchorMode" => AnchorCommand::InitCloudMode,
            "uploadAnchor" => AnchorCommand::UploadAnchor {
                name: string_arg(args, "nodeName")?,
                ttl_days: ttl_arg(args)?,
            },
            "downloadAnchor" => AnchorCommand::DownloadAnchor {
                cloud_id: string_arg(args, "cloudanchorid")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

fn string_arg(args: &Value, key: &str) -> AnchorResult<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AnchorError::invalid(format!("missing string argument '{key}'")))
}

fn transform_arg(args: &Value) -> AnchorResult<Transform> {
    let values = args
        .get("transform")
        .and_then(Value::as_array)
        .ok_or_else(|| AnchorError::invalid("missing array argument 'transform'"))?;
    let numbers = values
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| AnchorError::invalid("transform must contain only numbers"))
        })
        .collect::<AnchorResult<Vec<f64>>>()?;
    Transform::from_column_major(&numbers)
}

fn ttl_arg(args: &Value) -> AnchorResult<Option<u32>> {
    match args.get("ttl") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let ttl = value
                .as_i64()
                .ok_or_else(|| AnchorError::invalid("'ttl' must be an integer"))?;
            u32::try_from(ttl)
                .map(Some)
                .map_err(|_| AnchorError::invalid(format!("'ttl' out of range: {ttl}")))
        }
    }
}

impl AnchorManager {
    /// Handle one anchor channel method call.
    pub async fn handle_method_call(&self, method: &str, args: &Value) -> MethodResponse {
        let command = match AnchorCommand::parse(method, args) {
            Ok(Some(command)) => command,
            Ok(None) => {
                tracing::debug!(method = %method, "Unknown anchor method");
                return MethodResponse::NotImplemented;
            }
            Err(err) if method == "addAnchor" => {
                tracing::warn!(error = %err, "addAnchor with wrong arguments");
                return MethodResponse::success(false);
            }
            Err(err) => return MethodResponse::from(&err),
        };
        self.execute(command).await
    }

    /// Run a parsed command.
    pub async fn execute(&self, command: AnchorCommand) -> MethodResponse {
        match command {
            AnchorCommand::Init => MethodResponse::null(),
            AnchorCommand::AddAnchor {
                kind,
                transform,
                name,
            } => match self.add_anchor(kind, transform, &name).await {
                Ok(_) => MethodResponse::success(true),
                Err(err) => {
                    tracing::warn!(name = %name, error = %err, "addAnchor failed");
                    MethodResponse::success(false)
                }
            },
            AnchorCommand::RemoveAnchor { name } => {
                self.remove_anchor(&name).await;
                MethodResponse::null()
            }
            AnchorCommand::InitCloudMode => match self.init_cloud_mode().await {
                Ok(()) => MethodResponse::null(),
                Err(err) => MethodResponse::from(&err),
            },
            AnchorCommand::UploadAnchor { name, ttl_days } => {
                match self.upload_anchor(&name, ttl_days).await {
                    Ok(_) => MethodResponse::success(true),
                    Err(err) => MethodResponse::from(&err),
                }
            }
            AnchorCommand::DownloadAnchor { cloud_id } => {
                match self.download_anchor(&cloud_id).await {
                    Ok(_) => MethodResponse::null(),
                    Err(err) => MethodResponse::from(&err),
                }
            }
        }
    }
}
