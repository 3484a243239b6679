use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::sync::Arc;
use log::info;
use crate::models::trip::TripContext;

#[derive(Debug)]
pub enum PromptError {
    TemplateNotFound(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::TemplateNotFound(key) => write!(f, "Prompt template '{}' not found", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Canned queries offered next to the input box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuickAction {
    Sights,
    Restaurants,
    Cafes,
    /// Primes the user to type a place name; handled locally.
    AskForPlace,
}

impl QuickAction {
    pub fn key(&self) -> &'static str {
        match self {
            QuickAction::Sights => "sights",
            QuickAction::Restaurants => "restaurants",
            QuickAction::Cafes => "cafes",
            QuickAction::AskForPlace => "place",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PromptConfig {
    pub welcome_template: String,
    pub date_format: String,
    pub quick_actions: HashMap<String, String>,
    pub place_prompt: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        let quick_actions = [
            ("sights", "Tell me the popular sights in {city}"),
            ("restaurants", "Tell me the popular restaurants in {city}"),
            ("cafes", "Tell me the popular cafes in {city}"),
        ]
            .into_iter()
            .map(|(key, template)| (key.to_string(), template.to_string()))
            .collect();

        Self {
            welcome_template: concat!(
                "Hello {nickname}, you're travelling to {city} from {start_date} to {end_date}!\n",
                "Shall we start building your own travel plan, {nickname}?\n",
                "I can recommend all kinds of places such as sights, restaurants and cafes.\n",
                "Pick the kind of place you'd like recommendations for."
            ).to_string(),
            date_format: "%B %-d, %Y".to_string(),
            quick_actions,
            place_prompt: "Which place are you curious about? Type its name and I'll look it up.".to_string(),
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        for action in [QuickAction::Sights, QuickAction::Restaurants, QuickAction::Cafes] {
            if !self.quick_actions.contains_key(action.key()) {
                return Err(PromptError::TemplateNotFound(format!("quick_actions:{}", action.key())));
            }
        }
        Ok(())
    }
}

pub fn load_prompts_from_str(json_str: &str) -> Result<Arc<PromptConfig>, PromptError> {
    let config: PromptConfig = serde_json::from_str(json_str)?;
    config.validate()?;
    Ok(Arc::new(config))
}

pub fn load_prompts(path: &str) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(path)?;
    let config = load_prompts_from_str(&file_content)?;
    info!("Loaded prompt templates from: {}", path);
    Ok(config)
}

pub fn initialize_prompts(path: Option<&str>) -> Result<Arc<PromptConfig>, PromptError> {
    match path {
        Some(path) => load_prompts(path),
        None => {
            info!("No prompts file configured, using built-in templates");
            Ok(Arc::new(PromptConfig::default()))
        }
    }
}

pub fn get_welcome_message(config: &PromptConfig, context: &TripContext) -> String {
    config.welcome_template
        .replace("{nickname}", &context.owner_display_name)
        .replace("{city}", &context.city)
        .replace("{start_date}", &context.formatted_start(&config.date_format))
        .replace("{end_date}", &context.formatted_end(&config.date_format))
}

/// The query sent for a canned action, or `None` for actions with no query.
pub fn get_quick_action_query(
    config: &PromptConfig,
    action: QuickAction,
    city: &str
) -> Result<Option<String>, PromptError> {
    if action == QuickAction::AskForPlace {
        return Ok(None);
    }
    let template = config.quick_actions
        .get(action.key())
        .ok_or_else(|| PromptError::TemplateNotFound(format!("quick_actions:{}", action.key())))?;
    Ok(Some(template.replace("{city}", city)))
}
