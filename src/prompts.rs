//! Classification prompt templates.
//!
//! The deployed knowledge base (code definitions, rules, worked examples)
//! is maintained in Spanish upstream; the response contract it pins down is
//! what the parser tiers rely on: one JSON object with `razonamiento` and a
//! `clasificaciones` array of `{codigo, justificacion}` pairs.

/// System/user prompt pair builder for one classification run.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    user_template: String,
}

impl PromptSet {
    pub fn new(system: impl Into<String>, user_template: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user_template: user_template.into(),
        }
    }

    /// Render the (system, user) pair for one case text. The user template
    /// substitutes `{text}`.
    pub fn render(&self, case_text: &str) -> (String, String) {
        (
            self.system.clone(),
            self.user_template.replace("{text}", case_text),
        )
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT, DEFAULT_USER_TEMPLATE)
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"Eres un clasificador de delitos para encuestas de victimizacion.

# CODIGOS DE DELITO
- 9: Robo o intento de robo de dinero, celular o efectos personales.
- 21: Robo de vehiculo automotor (auto, camioneta, etc.).
- 2: Intento de robo de vehiculo automotor.

# REGLAS DE CLASIFICACION
1. PERIODO DE REFERENCIA: el hecho debe haber ocurrido en los ultimos 12 meses. Si es mas antiguo, IGNORAR.
2. PRINCIPIO DE SUFICIENCIA: si la observacion es ambigua y no explica el HECHO, NO clasificar.
3. NO ASUMIR DATOS: prohibido asumir fechas, parentescos o ubicaciones no escritas.

# FORMATO DE SALIDA
Responde UNICAMENTE con un JSON valido en este formato:
{"razonamiento": "tu analisis paso a paso", "clasificaciones": [{"codigo": "9", "justificacion": "descripcion del delito"}]}

Si NO hay delitos clasificables, responde:
{"razonamiento": "tu analisis", "clasificaciones": []}"#;

const DEFAULT_USER_TEMPLATE: &str = r#"Clasifica los delitos en esta observacion:

{text}

Responde SOLO con el JSON de clasificacion."#;
