//! Swift credentials obtained from an OpenStack identity (keystone v3)
//! service.
//!
//! A `keystone` storage auth carries the identity url along with a login.
//! Before a storage using it is opened, it is swapped for a plain `swift`
//! auth holding the object store url and a token, which are cached until the
//! token expires.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

use crate::handlers::http_client;
use crate::{Error, StorageAuth};

pub const AUTH_TYPE: &str = "keystone";

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

// tokens this close to their expiry are fetched anew.
const EXPIRY_MARGIN: Duration = Duration::seconds(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Clone)]
struct Credentials {
    storage_url: String,
    token: String,
    expires_at: DateTime<Utc>,
}

type CacheKey = (String, BTreeMap<String, String>);

/// Fetches and caches swift credentials for keystone auths.
#[derive(Default)]
pub struct KeystoneClient {
    tokens: Mutex<HashMap<CacheKey, Credentials>>,
}

impl KeystoneClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `swift` auth a `keystone` auth currently stands for.
    #[instrument(skip_all, err, fields(auth.url = %auth.url))]
    pub async fn authorize(&self, auth: &StorageAuth) -> Result<StorageAuth, Error> {
        let key = (auth.url.clone(), auth.parameters.clone());
        let cached = self
            .tokens
            .lock()
            .get(&key)
            .filter(|c| c.expires_at - EXPIRY_MARGIN > Utc::now())
            .cloned();

        let credentials = match cached {
            Some(credentials) => {
                debug!("using cached swift storage url and token");
                credentials
            }
            None => {
                let credentials = fetch(auth).await?;
                debug!(expires_at = %credentials.expires_at, "fetched swift storage url and token");
                self.tokens.lock().insert(key, credentials.clone());
                credentials
            }
        };

        let mut swift = StorageAuth::new("swift", credentials.storage_url)
            .with_parameter("auth_token", credentials.token);
        swift.name = auth.name.clone();
        Ok(swift)
    }
}

/// The process-wide client, so tokens are shared by everyone.
pub fn global() -> &'static KeystoneClient {
    static CLIENT: OnceLock<KeystoneClient> = OnceLock::new();
    CLIENT.get_or_init(KeystoneClient::new)
}

/// Swaps a keystone auth for the swift credentials it resolves to. Other
/// auths are returned as they are.
pub async fn resolve(
    auth: Option<&Arc<StorageAuth>>,
) -> Result<Option<Arc<StorageAuth>>, Error> {
    match auth {
        Some(auth) if auth.auth_type == AUTH_TYPE => {
            Ok(Some(Arc::new(global().authorize(auth).await?)))
        }
        other => Ok(other.cloned()),
    }
}

/// Checks that a keystone auth has a way to log in.
pub(crate) fn validate(parameters: &BTreeMap<String, String>) -> Result<(), Error> {
    let has_user = parameters.contains_key("username") || parameters.contains_key("user_id");
    if parameters.contains_key("auth_token") || (has_user && parameters.contains_key("password")) {
        return Ok(());
    }
    Err(Error::InvalidStorage(
        "keystone storage auth requires username and password, or an auth_token".to_string(),
    ))
}

/// The token endpoint for an identity url, adding the version to
/// versionless ones.
fn tokens_url(auth_url: &str, auth_version: Option<&str>) -> Result<Url, Error> {
    if matches!(auth_version, Some("2" | "2.0")) {
        return Err(Error::Unsupported("keystone identity v2".to_string()));
    }

    let mut url = Url::parse(auth_url)?;
    let path = url.path().trim_end_matches('/').to_string();
    let path = match path.rsplit('/').next().unwrap_or_default() {
        "v3" | "v3.0" => path,
        "v2" | "v2.0" => return Err(Error::Unsupported("keystone identity v2".to_string())),
        _ => format!("{}/v3", path),
    };
    url.set_path(&format!("{}/auth/tokens", path));
    Ok(url)
}

fn domain(parameters: &BTreeMap<String, String>, prefix: &str) -> Value {
    match parameters.get(&format!("{}_id", prefix)) {
        Some(id) => json!({ "id": id }),
        None => json!({
            "name": parameters
                .get(&format!("{}_name", prefix))
                .map(String::as_str)
                .unwrap_or("Default")
        }),
    }
}

fn request_body(parameters: &BTreeMap<String, String>) -> Result<Value, Error> {
    validate(parameters)?;
    let param = |key: &str| parameters.get(key);

    let identity = match param("auth_token") {
        Some(token) => json!({ "methods": ["token"], "token": { "id": token } }),
        None => {
            let mut user = json!({ "password": param("password") });
            match (param("user_id"), param("username")) {
                (Some(id), _) => user["id"] = json!(id),
                (None, name) => {
                    user["name"] = json!(name);
                    user["domain"] = domain(parameters, "user_domain");
                }
            }
            json!({ "methods": ["password"], "password": { "user": user } })
        }
    };

    let mut body = json!({ "auth": { "identity": identity } });
    let project = match (
        param("project_id").or(param("tenant_id")),
        param("project_name").or(param("tenant_name")),
    ) {
        (Some(id), _) => Some(json!({ "id": id })),
        (None, Some(name)) => Some(json!({ "name": name, "domain": domain(parameters, "project_domain") })),
        (None, None) => None,
    };
    if let Some(project) = project {
        body["auth"]["scope"] = json!({ "project": project });
    }
    Ok(body)
}

/// Picks the object store endpoint out of a service catalog.
fn storage_url(
    catalog: &[Service],
    parameters: &BTreeMap<String, String>,
) -> Result<String, Error> {
    let service_type = parameters
        .get("service_type")
        .map(String::as_str)
        .unwrap_or("object-store");
    let interface = match parameters
        .get("endpoint_type")
        .map(String::as_str)
        .unwrap_or("publicURL")
    {
        "publicURL" => "public",
        "internalURL" => "internal",
        "adminURL" => "admin",
        other => other,
    };
    let region = parameters.get("region_name");

    catalog
        .iter()
        .filter(|s| s.service_type == service_type)
        .flat_map(|s| s.endpoints.iter())
        .find(|e| {
            e.interface == interface
                && region.map_or(true, |r| {
                    e.region.as_ref() == Some(r) || e.region_id.as_ref() == Some(r)
                })
        })
        .map(|e| e.url.clone())
        .ok_or_else(|| {
            Error::InvalidStorage(format!(
                "no {} endpoint for {} found, have you specified a region?",
                interface, service_type
            ))
        })
}

async fn fetch(auth: &StorageAuth) -> Result<Credentials, Error> {
    let parameters = &auth.parameters;
    let url = tokens_url(&auth.url, parameters.get("auth_version").map(String::as_str))?;

    let resp = http_client()?
        .post(url)
        .json(&request_body(parameters)?)
        .send()
        .await?
        .error_for_status()?;

    let token = resp
        .headers()
        .get(SUBJECT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Connection(format!("keystone answered without {}", SUBJECT_TOKEN_HEADER))
        })?;
    let body: TokenResponse = resp.json().await?;

    Ok(Credentials {
        storage_url: storage_url(&body.token.catalog, parameters)?,
        token,
        expires_at: body.token.expires_at,
    })
}
