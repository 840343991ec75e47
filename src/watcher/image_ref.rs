// Image reference parsing: `[domain/]path[:tag][@digest]`

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: Option<String>,
    pub path: String,
    pub tag: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Self {
        let without_digest = reference.split('@').next().unwrap_or(reference);
        let (name, tag) = match without_digest.rfind(':') {
            Some(i) if !without_digest[i + 1..].contains('/') => {
                (&without_digest[..i], Some(without_digest[i + 1..].to_string()))
            }
            _ => (without_digest, None),
        };
        let (domain, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, name.to_string()),
        };
        Self { domain, path, tag }
    }

    pub fn tag_or_latest(&self) -> String {
        self.tag.clone().unwrap_or_else(|| "latest".to_string())
    }
}
