//! Pluggable marshalling: format tags, the model registry, and encode/decode.
//!
//! The registry holds the closed set of domain types the client is allowed to
//! (de)serialize. It is built once, then shared read-only; there is no
//! ambient state around encode/decode. Structured formats (XML, JSON) reject
//! values whose runtime type is not registered instead of attempting a
//! best-effort serialization.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClientError, Result};

/// Marshalling format for one leg of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Self-describing XML document; the root element names the model type.
    Xml,
    /// JSON object; decoding without an expected type probes registered
    /// types in sorted-name order.
    Json,
    /// Raw string, identity in both directions.
    Text,
}

/// A value that can travel through the client: any debuggable runtime type
/// that can be shared across tasks.
///
/// Blanket-implemented; callers never implement this by hand.
pub trait Model: Any + Debug + Send + Sync {
    /// Upcast for downcasting by the registry.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Debug + Send + Sync> Model for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A decoded message body: the model's registered name plus the value.
pub struct Decoded {
    /// Short type name the value was decoded as.
    pub type_name: String,
    /// The decoded value.
    pub value: Box<dyn Any + Send>,
}

impl Decoded {
    /// Downcasts the decoded value to a concrete type.
    pub fn downcast<T: 'static>(self) -> Result<T> {
        self.value.downcast::<T>().map(|b| *b).map_err(|_| {
            ClientError::marshal(format!(
                "decoded value of type [{}] is not the expected type",
                self.type_name
            ))
        })
    }
}

impl Debug for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoded")
            .field("type_name", &self.type_name)
            .finish()
    }
}

type EncodeFn = Box<dyn Fn(&dyn Model) -> Result<String> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&str) -> Result<Box<dyn Any + Send>> + Send + Sync>;

struct ModelEntry {
    encode_json: EncodeFn,
    decode_json: DecodeFn,
    encode_xml: EncodeFn,
    decode_xml: DecodeFn,
}

/// The set of known model types, with per-format codecs for each.
///
/// Keys are short type names (the last path segment of the Rust type name),
/// which double as XML root element names and destination-map keys. The
/// backing map is sorted so JSON type probing is deterministic.
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelEntry>,
    names: HashMap<TypeId, String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            names: HashMap::new(),
        }
    }

    /// Registers a model type, keyed by its short type name.
    pub fn register<T>(mut self) -> Self
    where
        T: Serialize + DeserializeOwned + Debug + Send + 'static,
    {
        let name = short_type_name::<T>().to_string();
        let xml_root = name.clone();
        let entry = ModelEntry {
            encode_json: Box::new(move |value| {
                let typed = downcast_model::<T>(value)?;
                serde_json::to_string(typed)
                    .map_err(|e| ClientError::marshal(format!("json encode failed: {e}")))
            }),
            decode_json: Box::new(|text| {
                serde_json::from_str::<T>(text)
                    .map(|v| Box::new(v) as Box<dyn Any + Send>)
                    .map_err(|e| ClientError::marshal(format!("json decode failed: {e}")))
            }),
            encode_xml: Box::new(move |value| {
                let typed = downcast_model::<T>(value)?;
                quick_xml::se::to_string_with_root(&xml_root, typed)
                    .map_err(|e| ClientError::marshal(format!("xml encode failed: {e}")))
            }),
            decode_xml: Box::new(|text| {
                quick_xml::de::from_str::<T>(text)
                    .map(|v| Box::new(v) as Box<dyn Any + Send>)
                    .map_err(|e| ClientError::marshal(format!("xml decode failed: {e}")))
            }),
        };
        self.names.insert(TypeId::of::<T>(), name.clone());
        self.entries.insert(name, entry);
        self
    }

    /// Returns `true` when no model type is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered short type names, in sorted (probing) order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The registered name of a value's runtime type, if any.
    pub fn name_of(&self, value: &dyn Model) -> Option<&str> {
        self.names
            .get(&value.as_any().type_id())
            .map(String::as_str)
    }

    /// Encodes a value in the given format.
    ///
    /// Text renders the value as-is (identity for `String`, `Debug` for
    /// anything else) and always succeeds. XML/JSON require a non-empty
    /// registry and a registered runtime type.
    pub fn encode(&self, format: Format, value: &dyn Model) -> Result<String> {
        match format {
            Format::Text => {
                if let Some(s) = value.as_any().downcast_ref::<String>() {
                    Ok(s.clone())
                } else {
                    Ok(format!("{value:?}"))
                }
            }
            Format::Json => (self.entry_for(value)?.encode_json)(value),
            Format::Xml => (self.entry_for(value)?.encode_xml)(value),
        }
    }

    /// Decodes text without an expected type.
    ///
    /// Text wraps the raw string. XML reads the self-describing root element
    /// name. JSON probes every registered type in sorted-name order and the
    /// first syntactic success wins; with overlapping schemas this resolves
    /// to the name that sorts first, by design.
    pub fn decode(&self, format: Format, text: &str) -> Result<Decoded> {
        match format {
            Format::Text => Ok(Decoded {
                type_name: "String".to_string(),
                value: Box::new(text.to_string()),
            }),
            Format::Json => {
                self.require_models()?;
                for (name, entry) in &self.entries {
                    if let Ok(value) = (entry.decode_json)(text) {
                        return Ok(Decoded {
                            type_name: name.clone(),
                            value,
                        });
                    }
                }
                Err(ClientError::marshal(format!(
                    "no registered type matched message [{text}]"
                )))
            }
            Format::Xml => {
                self.require_models()?;
                let root = xml_root_name(text)?;
                let entry = self.entries.get(root).ok_or_else(|| {
                    ClientError::marshal(format!(
                        "no registered type for xml root [{root}] in message [{text}]"
                    ))
                })?;
                Ok(Decoded {
                    type_name: root.to_string(),
                    value: (entry.decode_xml)(text)?,
                })
            }
        }
    }

    /// Decodes text against an expected type.
    ///
    /// Structured formats still require the type to be registered.
    pub fn decode_as<T>(&self, format: Format, text: &str) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        match format {
            Format::Text => {
                let boxed: Box<dyn Any> = Box::new(text.to_string());
                boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                    ClientError::marshal("raw string decode only produces String")
                })
            }
            Format::Json => {
                self.require_registered::<T>()?;
                serde_json::from_str::<T>(text).map_err(|e| {
                    ClientError::marshal(format!("json decode failed for [{text}]: {e}"))
                })
            }
            Format::Xml => {
                self.require_registered::<T>()?;
                quick_xml::de::from_str::<T>(text).map_err(|e| {
                    ClientError::marshal(format!("xml decode failed for [{text}]: {e}"))
                })
            }
        }
    }

    fn entry_for(&self, value: &dyn Model) -> Result<&ModelEntry> {
        self.require_models()?;
        let name = self.name_of(value).ok_or_else(|| {
            ClientError::marshal(format!("type not registered for value [{value:?}]"))
        })?;
        Ok(&self.entries[name])
    }

    fn require_models(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(ClientError::config(
                "model registry is empty; structured formats need registered types",
            ));
        }
        Ok(())
    }

    fn require_registered<T: 'static>(&self) -> Result<()> {
        self.require_models()?;
        if !self.names.contains_key(&TypeId::of::<T>()) {
            return Err(ClientError::marshal(format!(
                "type not registered: {}",
                short_type_name::<T>()
            )));
        }
        Ok(())
    }
}

impl Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The last path segment of a Rust type name, with any generic arguments
/// stripped (`collections::Batch<Order>` yields `Batch`).
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn downcast_model<T: 'static>(value: &dyn Model) -> Result<&T> {
    value.as_any().downcast_ref::<T>().ok_or_else(|| {
        ClientError::marshal(format!("value [{value:?}] is not the registered type"))
    })
}

/// Extracts the root element name from an XML document.
fn xml_root_name(text: &str) -> Result<&str> {
    let mut rest = text.trim_start();
    // skip the declaration if present
    if let Some(stripped) = rest.strip_prefix("<?") {
        let end = stripped.find("?>").ok_or_else(|| {
            ClientError::marshal(format!("unterminated xml declaration in [{text}]"))
        })?;
        rest = stripped[end + 2..].trim_start();
    }
    let body = rest
        .strip_prefix('<')
        .ok_or_else(|| ClientError::marshal(format!("not an xml document: [{text}]")))?;
    let end = body
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(body.len());
    let name = &body[..end];
    if name.is_empty() {
        return Err(ClientError::marshal(format!(
            "missing xml root element in [{text}]"
        )));
    }
    Ok(name)
}
