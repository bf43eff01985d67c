//! Typed view of a [`MountRequest`]. All JSON the driver sends is parsed and validated here, no
//! untyped data leaves this module.

use crate::auth::{AuthMode, AuthOverrides, PodIdentity, ServiceAccountToken};
use crate::error::{Error, Result};
use crate::secretmanager::ResourceName;
use gcp_provider_pb::provider::v1alpha1::MountRequest;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

const ATTR_SECRETS: &str = "secrets";
const ATTR_POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
const ATTR_POD_NAME: &str = "csi.storage.k8s.io/pod.name";
const ATTR_POD_UID: &str = "csi.storage.k8s.io/pod.uid";
const ATTR_SERVICE_ACCOUNT: &str = "csi.storage.k8s.io/serviceAccount.name";
const ATTR_SERVICE_ACCOUNT_TOKENS: &str = "csi.storage.k8s.io/serviceAccount.tokens";
const ATTR_AUTH: &str = "auth";

const AUTH_POD_ADC: &str = "pod-adc";
const AUTH_PROVIDER_ADC: &str = "provider-adc";

/// Key of the node publish secret holding a service account key.
const SECRET_KEY_JSON: &str = "key.json";

const MAX_FILE_MODE: u32 = 0o777;

/// One entry of the `secrets` attribute.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ObjectSpec {
    resource_name: String,
    file_name: String,
    #[serde(default, alias = "filePermission")]
    mode: Option<u32>,
}

/// A secret to mount, in request order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SecretObject {
    /// The resource name exactly as requested, echoed back as the object version id.
    pub(crate) id: String,
    pub(crate) resource: ResourceName,
    /// Path of the file relative to the target path.
    pub(crate) file_name: String,
    pub(crate) mode: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct MountParams {
    pub(crate) target_path: PathBuf,
    pub(crate) pod: PodIdentity,
    pub(crate) auth: AuthOverrides,
    pub(crate) objects: Vec<SecretObject>,
    /// The request level file mode.
    pub(crate) permission: Option<u32>,
    /// Versions currently in the volume, keyed by object id.
    pub(crate) current_versions: HashMap<String, String>,
}

impl TryFrom<&MountRequest> for MountParams {
    type Error = Error;

    fn try_from(request: &MountRequest) -> Result<Self> {
        let target_path = parse_target_path(&request.target_path)?;

        let attributes: HashMap<String, String> = serde_json::from_str(&request.attributes)
            .map_err(|e| Error::InvalidArgument(format!("failed to parse attributes: {e}")))?;

        let objects = parse_objects(attributes.get(ATTR_SECRETS).map(String::as_str))?;
        let pod = parse_pod(&attributes)?;
        let auth = AuthOverrides {
            mode: parse_auth_mode(attributes.get(ATTR_AUTH).map(String::as_str))?,
            service_account_key: parse_secrets(&request.secrets)?,
        };
        let permission = parse_permission(&request.permission)?;

        let current_versions = request
            .current_object_version
            .iter()
            .map(|v| (v.id.clone(), v.version.clone()))
            .collect();

        Ok(Self {
            target_path,
            pod,
            auth,
            objects,
            permission,
            current_versions,
        })
    }
}

fn parse_target_path(target_path: &str) -> Result<PathBuf> {
    if target_path.is_empty() {
        return Err(Error::InvalidArgument("target path is empty".to_string()));
    }
    let path = Path::new(target_path);
    if !path.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "target path {target_path:?} is not absolute"
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(Error::InvalidArgument(format!(
            "target path {target_path:?} contains a parent directory segment"
        )));
    }
    Ok(path.to_path_buf())
}

/// A file name has to stay inside the target path. Returns the name without `.` segments and
/// repeated separators, two names that normalize the same refer to the same file.
fn validate_file_name(file_name: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(file_name).components() {
        match component {
            Component::Normal(name) => normalized.push(name),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidArgument(format!(
                    "file name {file_name:?} must be a relative path inside the target path"
                )));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidArgument(format!(
            "file name {file_name:?} is empty"
        )));
    }
    Ok(normalized)
}

fn parse_objects(secrets: Option<&str>) -> Result<Vec<SecretObject>> {
    let secrets = secrets.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
        Error::InvalidArgument(format!("attribute {ATTR_SECRETS:?} is missing"))
    })?;
    let specs: Vec<ObjectSpec> = serde_json::from_str(secrets)
        .map_err(|e| Error::InvalidArgument(format!("failed to parse {ATTR_SECRETS:?}: {e}")))?;
    if specs.is_empty() {
        return Err(Error::InvalidArgument("no secrets requested".to_string()));
    }

    let mut file_names = HashSet::with_capacity(specs.len());
    specs
        .into_iter()
        .map(|spec| {
            if !file_names.insert(validate_file_name(&spec.file_name)?) {
                return Err(Error::InvalidArgument(format!(
                    "file name {:?} is used by more than one secret",
                    spec.file_name
                )));
            }
            if let Some(mode) = spec.mode.filter(|mode| *mode > MAX_FILE_MODE) {
                return Err(Error::InvalidArgument(format!(
                    "mode {mode:#o} of {:?} is not a valid file mode",
                    spec.file_name
                )));
            }
            Ok(SecretObject {
                resource: spec.resource_name.parse()?,
                id: spec.resource_name,
                file_name: spec.file_name,
                mode: spec.mode,
            })
        })
        .collect()
}

fn parse_pod(attributes: &HashMap<String, String>) -> Result<PodIdentity> {
    let required = |key: &str| {
        attributes
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("attribute {key:?} is missing")))
    };

    let tokens = match attributes
        .get(ATTR_SERVICE_ACCOUNT_TOKENS)
        .filter(|v| !v.is_empty())
    {
        Some(tokens) => serde_json::from_str::<HashMap<String, ServiceAccountToken>>(tokens)
            .map_err(|e| {
                Error::InvalidArgument(format!(
                    "failed to parse {ATTR_SERVICE_ACCOUNT_TOKENS:?}: {e}"
                ))
            })?,
        None => HashMap::new(),
    };

    Ok(PodIdentity {
        namespace: required(ATTR_POD_NAMESPACE)?,
        name: required(ATTR_POD_NAME)?,
        uid: required(ATTR_POD_UID)?,
        service_account: required(ATTR_SERVICE_ACCOUNT)?,
        tokens,
    })
}

fn parse_auth_mode(auth: Option<&str>) -> Result<AuthMode> {
    match auth {
        None | Some("") | Some(AUTH_POD_ADC) => Ok(AuthMode::PodAdc),
        Some(AUTH_PROVIDER_ADC) => Ok(AuthMode::ProviderAdc),
        Some(other) => Err(Error::InvalidArgument(format!(
            "unknown auth {other:?}, expected {AUTH_POD_ADC:?} or {AUTH_PROVIDER_ADC:?}"
        ))),
    }
}

/// The service account key of the node publish secret, if any. Never logged.
fn parse_secrets(secrets: &str) -> Result<Option<String>> {
    if secrets.trim().is_empty() {
        return Ok(None);
    }
    let mut secrets: HashMap<String, String> = serde_json::from_str(secrets)
        .map_err(|_| Error::InvalidArgument("failed to parse node publish secrets".to_string()))?;
    Ok(secrets.remove(SECRET_KEY_JSON).filter(|key| !key.is_empty()))
}

fn parse_permission(permission: &str) -> Result<Option<u32>> {
    if permission.trim().is_empty() {
        return Ok(None);
    }
    let mode: u32 = serde_json::from_str(permission).map_err(|e| {
        Error::InvalidArgument(format!("failed to parse permission {permission:?}: {e}"))
    })?;
    if mode > MAX_FILE_MODE {
        return Err(Error::InvalidArgument(format!(
            "permission {mode:#o} is not a valid file mode"
        )));
    }
    Ok(Some(mode))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gcp_provider_pb::provider::v1alpha1::ObjectVersion;

    pub(crate) fn attributes(secrets: serde_json::Value) -> String {
        serde_json::json!({
            "secrets": secrets.to_string(),
            "csi.storage.k8s.io/pod.namespace": "default",
            "csi.storage.k8s.io/pod.name": "app-0",
            "csi.storage.k8s.io/pod.uid": "1234-5678",
            "csi.storage.k8s.io/serviceAccount.name": "app",
            "csi.storage.k8s.io/ephemeral": "true",
        })
        .to_string()
    }

    pub(crate) fn mount_request(secrets: serde_json::Value) -> MountRequest {
        MountRequest {
            attributes: attributes(secrets),
            secrets: String::new(),
            target_path: "/var/lib/kubelet/pods/1234-5678/volumes/secrets".to_string(),
            permission: String::new(),
            current_object_version: vec![],
        }
    }

    fn invalid(request: &MountRequest) -> bool {
        matches!(
            MountParams::try_from(request),
            Err(Error::InvalidArgument(_))
        )
    }

    #[test]
    fn test_parse() {
        let mut request = mount_request(serde_json::json!([
            {"resourceName": "projects/p/secrets/s1/versions/latest", "fileName": "s1.txt"},
            {"resourceName": "projects/p/secrets/s2", "fileName": "dir/s2.txt", "mode": 288},
            {"resourceName": "projects/p/secrets/s3/versions/2", "fileName": "s3", "filePermission": 420},
        ]));
        request.permission = "384".to_string();
        request.current_object_version = vec![ObjectVersion {
            id: "projects/p/secrets/s1/versions/latest".to_string(),
            version: "2".to_string(),
        }];

        let params = MountParams::try_from(&request).unwrap();
        assert_eq!(
            params.target_path,
            PathBuf::from("/var/lib/kubelet/pods/1234-5678/volumes/secrets")
        );
        assert_eq!(params.pod.namespace, "default");
        assert_eq!(params.pod.name, "app-0");
        assert_eq!(params.pod.uid, "1234-5678");
        assert_eq!(params.pod.service_account, "app");
        assert_eq!(params.auth, AuthOverrides::default());
        assert_eq!(params.permission, Some(384));
        assert_eq!(
            params.current_versions.get("projects/p/secrets/s1/versions/latest"),
            Some(&"2".to_string())
        );

        let ids: Vec<&str> = params.objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "projects/p/secrets/s1/versions/latest",
                "projects/p/secrets/s2",
                "projects/p/secrets/s3/versions/2",
            ]
        );
        let modes: Vec<Option<u32>> = params.objects.iter().map(|o| o.mode).collect();
        assert_eq!(modes, vec![None, Some(288), Some(420)]);
        assert_eq!(params.objects[1].resource.version(), "latest");
    }

    #[test]
    fn test_target_path_validation() {
        for target_path in ["", "relative/path", "/var/lib/../../etc"] {
            let mut request = mount_request(serde_json::json!([
                {"resourceName": "projects/p/secrets/s1", "fileName": "s1.txt"},
            ]));
            request.target_path = target_path.to_string();
            assert!(invalid(&request), "{target_path:?} should be rejected");
        }
    }

    #[test]
    fn test_file_name_traversal() {
        for file_name in ["../escape", "a/../../b", "/etc/passwd", "", "."] {
            let request = mount_request(serde_json::json!([
                {"resourceName": "projects/p/secrets/s1", "fileName": file_name},
            ]));
            assert!(invalid(&request), "{file_name:?} should be rejected");
        }
    }

    #[test]
    fn test_objects_validation() {
        let cases = [
            serde_json::json!([]),
            serde_json::json!({"resourceName": "projects/p/secrets/s1", "fileName": "s1"}),
            serde_json::json!([{"resourceName": "projects/p/secrets/s1"}]),
            serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "s1", "path": "x"}]),
            serde_json::json!([{"resourceName": "secrets/s1", "fileName": "s1"}]),
            serde_json::json!([{"resourceName": "projects/p/locations/x@evil.example#/secrets/s1", "fileName": "s1"}]),
            serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "s1", "mode": 4096}]),
            serde_json::json!([
                {"resourceName": "projects/p/secrets/s1", "fileName": "same"},
                {"resourceName": "projects/p/secrets/s2", "fileName": "same"},
            ]),
        ];
        for secrets in cases {
            let request = mount_request(secrets.clone());
            assert!(invalid(&request), "{secrets} should be rejected");
        }
    }

    #[test]
    fn test_equivalent_file_names_collide() {
        let pairs = [("a", "./a"), ("dir/a", "dir//a"), ("dir/a", "./dir/./a"), ("a/", "a")];
        for (first, second) in pairs {
            let request = mount_request(serde_json::json!([
                {"resourceName": "projects/p/secrets/s1", "fileName": first},
                {"resourceName": "projects/p/secrets/s2", "fileName": second},
            ]));
            assert!(invalid(&request), "{first:?} and {second:?} should collide");
        }

        let request = mount_request(serde_json::json!([
            {"resourceName": "projects/p/secrets/s1", "fileName": "a"},
            {"resourceName": "projects/p/secrets/s2", "fileName": "dir/a"},
        ]));
        assert!(MountParams::try_from(&request).is_ok());
    }

    #[test]
    fn test_malformed_attributes() {
        let mut request = mount_request(serde_json::json!([]));
        request.attributes = "{not json".to_string();
        assert!(invalid(&request));

        request.attributes = serde_json::json!({"csi.storage.k8s.io/pod.name": "app-0"}).to_string();
        assert!(invalid(&request));
    }

    #[test]
    fn test_missing_pod_info() {
        let mut attributes: HashMap<String, String> = serde_json::from_str(&attributes(
            serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "s1"}]),
        ))
        .unwrap();
        attributes.remove(ATTR_SERVICE_ACCOUNT);
        let mut request = mount_request(serde_json::json!([]));
        request.attributes = serde_json::to_string(&attributes).unwrap();
        assert!(invalid(&request));
    }

    #[test]
    fn test_permission() {
        assert_eq!(parse_permission("").unwrap(), None);
        assert_eq!(parse_permission("420").unwrap(), Some(0o644));
        assert!(parse_permission("rw-r--r--").is_err());
        assert!(parse_permission("-1").is_err());
        assert!(parse_permission("1024").is_err());
    }

    #[test]
    fn test_auth_overrides() {
        let secrets = serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "s1"}]);
        let mut attributes: HashMap<String, String> =
            serde_json::from_str(&attributes(secrets.clone())).unwrap();
        attributes.insert(ATTR_AUTH.to_string(), AUTH_PROVIDER_ADC.to_string());

        let mut request = mount_request(secrets.clone());
        request.attributes = serde_json::to_string(&attributes).unwrap();
        request.secrets = serde_json::json!({"key.json": "{\"type\": \"service_account\"}"}).to_string();
        let params = MountParams::try_from(&request).unwrap();
        assert_eq!(params.auth.mode, AuthMode::ProviderAdc);
        assert_eq!(
            params.auth.service_account_key.as_deref(),
            Some("{\"type\": \"service_account\"}")
        );

        attributes.insert(ATTR_AUTH.to_string(), "node-adc".to_string());
        request.attributes = serde_json::to_string(&attributes).unwrap();
        assert!(invalid(&request));

        let mut request = mount_request(secrets);
        request.secrets = "not json".to_string();
        assert!(invalid(&request));
    }

    #[test]
    fn test_driver_tokens() {
        let secrets = serde_json::json!([{"resourceName": "projects/p/secrets/s1", "fileName": "s1"}]);
        let mut attributes: HashMap<String, String> =
            serde_json::from_str(&attributes(secrets.clone())).unwrap();
        attributes.insert(
            ATTR_SERVICE_ACCOUNT_TOKENS.to_string(),
            serde_json::json!({
                "p.svc.id.goog": {"token": "driver-token", "expirationTimestamp": "2030-01-01T00:00:00Z"},
            })
            .to_string(),
        );
        let mut request = mount_request(secrets);
        request.attributes = serde_json::to_string(&attributes).unwrap();

        let params = MountParams::try_from(&request).unwrap();
        assert_eq!(params.pod.tokens["p.svc.id.goog"].token, "driver-token");
    }
}
