// Docker Registry HTTP API v2: tag listing and manifest digest resolution

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, LINK, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;

use super::{ManifestDigest, RegistryError, RegistryProvider};
use crate::models::Image;

const MAX_TAG_PAGES: usize = 100;

pub const MEDIA_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

fn manifest_accept() -> String {
    [
        MEDIA_MANIFEST_LIST,
        MEDIA_OCI_INDEX,
        MEDIA_MANIFEST_V2,
        MEDIA_OCI_MANIFEST,
        MEDIA_MANIFEST_V1,
    ]
    .join(", ")
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    history: Vec<V1History>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V1History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    config: Option<V1Config>,
    #[serde(default)]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V1Config {
    #[serde(rename = "Image", default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
pub fn parse_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params.contains_key("realm").then_some(params)
}

/// Anonymous token exchange for a `WWW-Authenticate: Bearer` challenge.
async fn challenge_token(
    http: &reqwest::Client,
    challenge: &str,
    image: &Image,
) -> Result<Option<String>, RegistryError> {
    let Some(params) = parse_challenge(challenge) else {
        return Ok(None);
    };
    let realm = params.get("realm").map(String::as_str).unwrap_or_default();
    let mut url = Url::parse(realm).map_err(|e| RegistryError::Url(format!("{realm}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = params.get("service") {
            query.append_pair("service", service);
        }
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", image.name));
        query.append_pair("scope", &scope);
    }
    let response = http.get(url.clone()).send().await?;
    let response = check(response, url.as_str())?;
    let token: TokenResponse = response.json().await?;
    Ok(token.token.or(token.access_token))
}

fn check(response: Response, url: &str) -> Result<Response, RegistryError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Status {
            url: url.to_string(),
            status: response.status(),
        })
    }
}

/// Authenticated request; an unanswered bearer challenge is retried once with an
/// anonymous token.
pub async fn send<P>(
    provider: &P,
    image: &Image,
    method: Method,
    url: &str,
    accept: &str,
) -> Result<Response, RegistryError>
where
    P: RegistryProvider + ?Sized,
{
    let request = provider
        .http()
        .request(method.clone(), url)
        .header(ACCEPT, accept);
    let response = provider.authenticate(image, request).await?.send().await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return check(response, url);
    }
    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(challenge) = challenge else {
        return check(response, url);
    };
    let Some(token) = challenge_token(provider.http(), &challenge, image).await? else {
        return check(response, url);
    };
    tracing::debug!(registry = %provider.id(), "Retrying with challenge token");
    let retry = provider
        .http()
        .request(method, url)
        .header(ACCEPT, accept)
        .bearer_auth(token)
        .send()
        .await?;
    check(retry, url)
}

/// Target of a `Link: <...>; rel="next"` header, resolved against `current`.
fn next_page(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        current.join(target).ok()
    })
}

/// All tags of an image, sorted descending.
pub async fn get_tags<P>(provider: &P, image: &Image) -> Result<Vec<String>, RegistryError>
where
    P: RegistryProvider + ?Sized,
{
    let first = format!("{}/{}/tags/list", image.registry.url, image.name);
    let mut next = Some(Url::parse(&first).map_err(|e| RegistryError::Url(format!("{first}: {e}")))?);
    let mut tags = Vec::new();
    let mut pages = 0;
    while let Some(url) = next.take() {
        let response = send(provider, image, Method::GET, url.as_str(), "application/json").await?;
        next = next_page(&url, response.headers());
        let page: TagsPage = response.json().await?;
        tags.extend(page.tags.unwrap_or_default());
        pages += 1;
        if pages >= MAX_TAG_PAGES {
            tracing::warn!(image = %image.name, pages, "Tag listing truncated");
            break;
        }
    }
    tags.sort_by(|a, b| b.cmp(a));
    Ok(tags)
}

fn select_platform<'a>(manifests: &'a [Descriptor], image: &Image) -> Option<&'a Descriptor> {
    let same_os_arch = |d: &&Descriptor| {
        d.platform
            .as_ref()
            .is_some_and(|p| p.architecture == image.architecture && p.os == image.os)
    };
    let exact = manifests.iter().filter(same_os_arch).find(|d| {
        image.variant.is_none()
            || d.platform.as_ref().and_then(|p| p.variant.as_ref()) == image.variant.as_ref()
    });
    exact.or_else(|| manifests.iter().find(same_os_arch))
}

fn content_digest(headers: &HeaderMap) -> Option<String> {
    headers
        .get("docker-content-digest")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Resolve the manifest digest for `digest` (or the image tag).
///
/// Manifest lists pick the entry matching the image platform. Single v2/OCI manifests
/// use the content digest reported by the registry. Schema 1 manifests return the
/// embedded config image id and creation date.
pub async fn get_image_manifest_digest<P>(
    provider: &P,
    image: &Image,
    digest: Option<&str>,
) -> Result<ManifestDigest, RegistryError>
where
    P: RegistryProvider + ?Sized,
{
    let reference = digest.unwrap_or(&image.tag.value);
    let url = format!("{}/{}/manifests/{}", image.registry.url, image.name, reference);
    let accept = manifest_accept();
    let response = send(provider, image, Method::GET, &url, &accept).await?;
    let header_digest = content_digest(response.headers());
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let document: ManifestDocument = response.json().await?;

    if document.schema_version == 1 {
        let history = document
            .history
            .first()
            .ok_or_else(|| RegistryError::Manifest("v1 manifest without history".into()))?;
        let compat: V1Compatibility = serde_json::from_str(&history.v1_compatibility)
            .map_err(|e| RegistryError::Manifest(format!("v1Compatibility: {e}")))?;
        return Ok(ManifestDigest {
            digest: compat.config.and_then(|c| c.image).filter(|i| !i.is_empty()),
            created: compat.created,
            version: 1,
        });
    }

    let media_type = document.media_type.or(content_type).unwrap_or_default();
    let is_list = media_type.starts_with(MEDIA_MANIFEST_LIST)
        || media_type.starts_with(MEDIA_OCI_INDEX)
        || !document.manifests.is_empty();
    if is_list {
        let entry = select_platform(&document.manifests, image).ok_or_else(|| {
            RegistryError::Manifest(format!(
                "no manifest for platform {}/{}",
                image.os, image.architecture
            ))
        })?;
        return Ok(ManifestDigest {
            digest: Some(entry.digest.clone()),
            created: None,
            version: 2,
        });
    }

    if let Some(known) = digest {
        return Ok(ManifestDigest {
            digest: Some(known.to_string()),
            created: None,
            version: 2,
        });
    }
    let digest = match header_digest {
        Some(d) => Some(d),
        None => {
            let head = send(provider, image, Method::HEAD, &url, &media_type).await?;
            content_digest(head.headers())
        }
    };
    if digest.is_none() {
        return Err(RegistryError::Manifest("registry did not report a content digest".into()));
    }
    Ok(ManifestDigest {
        digest,
        created: None,
        version: 2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::image;

    #[test]
    fn challenge_is_parsed() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert!(parse_challenge("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn next_page_resolves_relative_links() {
        let current = Url::parse("https://registry.example.com/v2/app/tags/list").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            "</v2/app/tags/list?last=1.2&n=100>; rel=\"next\"".parse().unwrap(),
        );
        assert_eq!(
            next_page(&current, &headers).unwrap().as_str(),
            "https://registry.example.com/v2/app/tags/list?last=1.2&n=100"
        );
        assert!(next_page(&current, &HeaderMap::new()).is_none());
    }

    #[test]
    fn platform_selection_prefers_variant_then_falls_back() {
        let manifests: Vec<Descriptor> = serde_json::from_value(serde_json::json!([
            {"digest": "sha256:amd", "platform": {"architecture": "amd64", "os": "linux"}},
            {"digest": "sha256:armv6", "platform": {"architecture": "arm", "os": "linux", "variant": "v6"}},
            {"digest": "sha256:armv7", "platform": {"architecture": "arm", "os": "linux", "variant": "v7"}}
        ]))
        .unwrap();
        let mut arm = image("", "app");
        arm.architecture = "arm".into();
        arm.variant = Some("v7".into());
        assert_eq!(select_platform(&manifests, &arm).unwrap().digest, "sha256:armv7");

        arm.variant = Some("v8".into());
        assert_eq!(select_platform(&manifests, &arm).unwrap().digest, "sha256:armv6");

        assert_eq!(select_platform(&manifests, &image("", "app")).unwrap().digest, "sha256:amd");
    }
}
