//! Synchronous suggestions service and the static suggestion banks used by
//! every fallback path.

use std::sync::Arc;

use crate::services::generation::{AiGenerationService, SuggestionsInput, SuggestionsOutput};
use crate::services::quality::SuggestionCandidate;

pub struct SuggestionsService {
    generator: Option<Arc<AiGenerationService>>,
}

impl SuggestionsService {
    pub fn new(generator: Option<Arc<AiGenerationService>>) -> Self {
        Self { generator }
    }

    pub async fn generate(&self, input: SuggestionsInput) -> SuggestionsOutput {
        if let Some(generator) = &self.generator {
            return generator.generate_suggestions(input).await;
        }

        let locale = input.locale.to_lowercase();
        let is_portuguese = locale.starts_with("pt") || locale.is_empty();
        let tone = {
            let normalized = input.tone.trim().to_lowercase();
            if normalized.is_empty() { "neutro".to_string() } else { normalized }
        };

        let suggestions = if is_portuguese {
            build_pt_suggestions(&tone)
        } else {
            build_en_suggestions(&tone)
        };

        SuggestionsOutput {
            model_id: "fallback-local".to_string(),
            prompt_version: "reply_v1".to_string(),
            suggestions,
            quality_score: 0.55,
        }
    }
}

fn candidate(rank: i32, content: &str, rationale: &str) -> SuggestionCandidate {
    SuggestionCandidate { rank, content: content.to_string(), rationale: rationale.to_string() }
}

pub fn build_pt_suggestions(tone: &str) -> Vec<SuggestionCandidate> {
    match tone {
        "formal" => vec![
            candidate(1, "Perfeito, recebi sua solicitacao e vou retornar com uma atualizacao em instantes.", "Tom profissional e objetivo."),
            candidate(2, "Obrigado pelo contato. Estou validando os detalhes e te envio o status completo em seguida.", "Formal com acolhimento."),
            candidate(3, "Entendido. Vou priorizar esta demanda e te posiciono com os proximos passos ainda hoje.", "Formal orientado a acao."),
        ],
        "amigavel" => vec![
            candidate(1, "Valeu por avisar. Ja estou olhando isso e te retorno rapidinho.", "Tom proximo e leve."),
            candidate(2, "Boa! Recebi aqui e vou te mandar a resposta certinha em alguns minutos.", "Amigavel sem perder clareza."),
            candidate(3, "Fechado, pode deixar comigo. Ja te atualizo com os proximos passos.", "Tom colaborativo."),
        ],
        _ => vec![
            candidate(1, "Recebi sua mensagem e estou verificando. Te atualizo em seguida.", "Neutro e claro."),
            candidate(2, "Obrigado pelo retorno. Vou confirmar os detalhes e te envio o status ainda hoje.", "Neutro com compromisso de retorno."),
            candidate(3, "Entendi o contexto. Estou cuidando disso e te aviso assim que concluir.", "Neutro orientado a execucao."),
        ],
    }
}

pub fn build_en_suggestions(tone: &str) -> Vec<SuggestionCandidate> {
    match tone {
        "formal" => vec![
            candidate(1, "Thank you for your message. I am reviewing this and will send you an update shortly.", "Professional and concise."),
            candidate(2, "Understood. I will validate the details and share the current status with you soon.", "Formal with clear commitment."),
            candidate(3, "Received. I am prioritizing this request and will follow up with next steps today.", "Formal action-driven tone."),
        ],
        "amigavel" => vec![
            candidate(1, "Thanks for the heads-up. I am on it and will get back to you soon.", "Friendly and direct."),
            candidate(2, "Got it. I will check this now and send you a quick update in a bit.", "Friendly with urgency."),
            candidate(3, "Perfect, leave it with me. I will share the next steps shortly.", "Collaborative and warm."),
        ],
        _ => vec![
            candidate(1, "I received your message and I am checking it now. I will update you shortly.", "Neutral and clear."),
            candidate(2, "Thanks for the context. I will confirm the details and share status today.", "Neutral with commitment."),
            candidate(3, "Understood. I am handling this and will get back to you as soon as it is done.", "Neutral operational tone."),
        ],
    }
}

/// Picks the language bank for a locale.
pub fn bank_for(locale: &str, tone: &str) -> Vec<SuggestionCandidate> {
    if locale.trim().to_lowercase().starts_with("pt") {
        build_pt_suggestions(tone)
    } else {
        build_en_suggestions(tone)
    }
}
