use serde::Deserialize;

use crate::{
    error::ServiceError,
    model::{Capability, TokenCodec},
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ImageSource {
    Uri(String),
    Url { uri: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageMedia {
    pub image: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ContentItem {
    Text(String),
    Image(ImageMedia),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Image(ImageMedia),
    Mixed(Vec<ContentItem>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Content,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedInputs {
    pub input_ids: Vec<u32>,
    pub images: Vec<ImageMedia>,
}

impl Content {
    fn split(&self) -> (Vec<&str>, Vec<&ImageMedia>) {
        match self {
            Content::Text(text) => (vec![text.as_str()], Vec::new()),
            Content::Image(image) => (Vec::new(), vec![image]),
            Content::Mixed(items) => {
                let mut texts = Vec::new();
                let mut images = Vec::new();
                for item in items {
                    match item {
                        ContentItem::Text(text) => texts.push(text.as_str()),
                        ContentItem::Image(image) => images.push(image),
                    }
                }
                (texts, images)
            }
        }
    }
}

pub fn prepare_content(
    content: &Content,
    capability: Capability,
    codec: &dyn TokenCodec,
) -> Result<PreparedInputs, ServiceError> {
    let (texts, images) = content.split();
    let text = texts.join(" ");
    encode(&text, images, capability, codec)
}

pub fn prepare_chat(
    messages: &[Message],
    capability: Capability,
    codec: &dyn TokenCodec,
) -> Result<PreparedInputs, ServiceError> {
    if messages.is_empty() {
        return Err(ServiceError::BadRequest(
            "at least one message is required".into(),
        ));
    }

    let mut lines = Vec::with_capacity(messages.len());
    let mut images = Vec::new();
    for message in messages {
        let (texts, message_images) = message.content.split();
        lines.push(format!("{}: {}", message.role, texts.join(" ")));
        images.extend(message_images);
    }

    encode(&lines.join("\n"), images, capability, codec)
}

fn encode(
    text: &str,
    images: Vec<&ImageMedia>,
    capability: Capability,
    codec: &dyn TokenCodec,
) -> Result<PreparedInputs, ServiceError> {
    if !images.is_empty() && capability == Capability::TextOnly {
        return Err(ServiceError::UnsupportedModality("image"));
    }

    let input_ids = if text.trim().is_empty() {
        Vec::new()
    } else {
        codec
            .encode(text)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?
    };

    if input_ids.is_empty() && images.is_empty() {
        return Err(ServiceError::BadRequest("prompt must not be empty".into()));
    }

    Ok(PreparedInputs {
        input_ids,
        images: images.into_iter().cloned().collect(),
    })
}
