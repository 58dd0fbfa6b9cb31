use bytes::Bytes;
use rand::Rng;

/// Request payload, tagged with its kind at builder-call time. Serialization
/// happens when the builder method runs, so encoding an already-built body
/// is infallible and replayable across attempts.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Bytes),
    Text(String),
    Binary(Bytes),
    Form(String),
    Multipart {
        boundary: String,
        fields: Vec<(String, String)>,
    },
    Raw(Bytes),
}

impl RequestBody {
    pub(crate) fn encode(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Json(bytes) | Self::Binary(bytes) | Self::Raw(bytes) => bytes.clone(),
            Self::Text(text) => Bytes::from(text.clone().into_bytes()),
            Self::Form(encoded) => Bytes::from(encoded.clone().into_bytes()),
            Self::Multipart { boundary, fields } => encode_multipart(boundary, fields),
        }
    }
}

pub(crate) fn multipart_boundary() -> String {
    let mut rng = rand::rng();
    format!(
        "fetchx-{:016x}{:016x}",
        rng.random::<u64>(),
        rng.random::<u64>()
    )
}

fn encode_multipart(boundary: &str, fields: &[(String, String)]) -> Bytes {
    let mut encoded = Vec::new();
    for (name, value) in fields {
        encoded.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        encoded.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        encoded.extend_from_slice(value.as_bytes());
        encoded.extend_from_slice(b"\r\n");
    }
    encoded.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Bytes::from(encoded)
}
