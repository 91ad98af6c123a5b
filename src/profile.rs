//! Built-in voice personas.
//!
//! Each persona pairs a prebuilt Live API voice with the copy a front-end
//! shows for it, and builds the system prompt that pins the model to the
//! loaded document. The product copy is Spanish, as shipped.

use crate::link::OpenParams;

/// A selectable conversation persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceProfile {
    /// Stable identifier used on the command line and in config.
    pub id: &'static str,
    /// Display name, also woven into the system prompt.
    pub name: &'static str,
    /// Prebuilt voice name for the channel speech config.
    pub voice: &'static str,
    pub description: &'static str,
    /// Line a front-end may show while the first audio is in flight.
    pub greeting: &'static str,
}

pub const PROFILES: [VoiceProfile; 3] = [
    VoiceProfile {
        id: "luna",
        name: "Luna",
        voice: "Kore",
        description: "Tranquila y analítica, ideal para documentos técnicos.",
        greeting: "¡Hola! Soy Luna. Estoy lista para ayudarte a entender este documento. ¿Por dónde empezamos?",
    },
    VoiceProfile {
        id: "atlas",
        name: "Atlas",
        voice: "Fenrir",
        description: "Energético y curioso, le encanta profundizar en los conceptos.",
        greeting: "¡Qué tal! Soy Atlas. He estado revisando el material y es fascinante. ¡Pregúntame lo que quieras!",
    },
    VoiceProfile {
        id: "nova",
        name: "Nova",
        voice: "Zephyr",
        description: "Creativa y empática, excelente para resumir y dar ejemplos.",
        greeting: "¡Hola! Soy Nova. Me encanta este tema. ¿Quieres que te explique algo con un ejemplo?",
    },
];

/// Look up a persona by id, case-insensitive.
pub fn find(id: &str) -> Option<&'static VoiceProfile> {
    PROFILES.iter().find(|p| p.id.eq_ignore_ascii_case(id))
}

pub fn default_profile() -> &'static VoiceProfile {
    &PROFILES[0]
}

impl VoiceProfile {
    /// Build the system prompt that restricts the model to `document`.
    pub fn system_prompt(&self, document: &str) -> String {
        format!(
            "Eres {}, un asistente amigable. \
             Tu conocimiento se limita ESTRICTAMENTE al documento proporcionado a continuación. \
             Si el usuario pregunta algo que no está en el documento, indícalo amablemente. \
             Puedes enriquecer las ideas con ejemplos o conceptos adicionales \
             SIEMPRE QUE se alineen con el contexto del documento.\n\n\
             DOCUMENTO:\n{}",
            self.name, document
        )
    }

    /// Ready-to-send open parameters for a session over `document`.
    pub fn open_params(&self, document: &str) -> OpenParams {
        OpenParams {
            system_prompt: self.system_prompt(document),
            voice_id: self.voice.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(find("luna").map(|p| p.voice), Some("Kore"));
        assert_eq!(find("ATLAS").map(|p| p.voice), Some("Fenrir"));
        assert_eq!(find("Nova").map(|p| p.voice), Some("Zephyr"));
        assert!(find("vega").is_none());
    }

    #[test]
    fn default_is_the_first_entry() {
        assert_eq!(default_profile().id, "luna");
    }

    #[test]
    fn prompt_pins_the_document() {
        let p = find("nova").unwrap();
        let prompt = p.system_prompt("El agua hierve a 100 grados.");
        assert!(prompt.starts_with("Eres Nova"));
        assert!(prompt.contains("ESTRICTAMENTE"));
        assert!(prompt.ends_with("DOCUMENTO:\nEl agua hierve a 100 grados."));
    }

    #[test]
    fn open_params_carry_the_voice() {
        let params = find("atlas").unwrap().open_params("doc");
        assert_eq!(params.voice_id, "Fenrir");
        assert!(params.system_prompt.contains("Eres Atlas"));
    }
}
