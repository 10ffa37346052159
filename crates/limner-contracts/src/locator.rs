/// Where a generated image can be read from.
///
/// Providers that hand back a download link produce `RemoteUrl`; providers that
/// inline the image in their response produce `Embedded` with the base64 text
/// untouched, so the artifact store decides when to decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocator {
    RemoteUrl(String),
    Embedded { media_type: String, payload: String },
}

impl ImageLocator {
    pub fn embedded_png(payload: impl Into<String>) -> Self {
        Self::Embedded {
            media_type: "image/png".to_string(),
            payload: payload.into(),
        }
    }

    /// Short form for logs; embedded payloads are not echoed.
    pub fn describe(&self) -> String {
        match self {
            Self::RemoteUrl(url) => url.clone(),
            Self::Embedded {
                media_type,
                payload,
            } => format!("embedded {media_type} ({} base64 chars)", payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ImageLocator;

    #[test]
    fn describe_hides_embedded_payload() {
        let locator = ImageLocator::embedded_png("QUJD");
        assert_eq!(locator.describe(), "embedded image/png (4 base64 chars)");
        assert_eq!(
            ImageLocator::RemoteUrl("https://cdn.example.com/a.png".to_string()).describe(),
            "https://cdn.example.com/a.png"
        );
    }
}
