use common::utils::config::AppConfig;

use crate::router::Route;

/// Per-route retrieval and generation knobs.
#[derive(Debug, Clone)]
pub struct RouteParams {
    pub k: usize,
    pub num_candidates: usize,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub model: String,
}

/// Candidate pool sizes tuned per route; quote finding casts the widest net.
const QUOTE_CANDIDATES: usize = 1_200;
const GUIDE_CANDIDATES: usize = 800;
const SUMMARY_CANDIDATES: usize = 800;

pub fn params_for(route: Route, config: &AppConfig) -> RouteParams {
    match route {
        Route::GeneralQa => RouteParams {
            k: config.rag_k,
            num_candidates: config.rag_candidates,
            temperature: config.rag_temp_general,
            max_output_tokens: config.rag_max_tokens,
            model: config.route_models.general_qa.clone(),
        },
        Route::FollowUp => RouteParams {
            k: config.rag_k_followup,
            num_candidates: config.rag_candidates,
            temperature: config.rag_temp_followup,
            max_output_tokens: config.rag_max_tokens,
            model: config.route_models.follow_up.clone(),
        },
        Route::QuoteFinding => RouteParams {
            k: config.rag_k_quote,
            num_candidates: QUOTE_CANDIDATES,
            temperature: config.rag_temp_quote,
            max_output_tokens: config.rag_max_tokens_quote,
            model: config.route_models.quote_finding.clone(),
        },
        Route::GenerateStudyGuide => RouteParams {
            k: config.rag_k_guide,
            num_candidates: GUIDE_CANDIDATES,
            temperature: config.rag_temp_guide,
            max_output_tokens: config.rag_max_tokens_guide,
            model: config.route_models.generate_study_guide.clone(),
        },
        Route::Summary => RouteParams {
            k: config.rag_k_sum,
            num_candidates: SUMMARY_CANDIDATES,
            temperature: config.rag_temp_sum,
            max_output_tokens: config.rag_max_tokens_sum,
            model: config.route_models.summary.clone(),
        },
    }
}
