//! End-to-end runs of the stage pipeline against a scripted completion client.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use synthscope::completion::{Completion, CompletionClient, CompletionRequest, TransportError};
use synthscope::config::{LlmConfig, PipelineConfig};
use synthscope::extract::ClinicalFormat;
use synthscope::personas::{PersonaCatalogue, PersonaKey};
use synthscope::refiner::{FirstCandidate, IndexSelector};
use synthscope::summary::keys;
use synthscope::{Pipeline, Stage, StrategyError};
use tokio_util::sync::CancellationToken;

const REPHRASE: &str = "New Question: Does aspirin reduce stroke in adults over 65?\nRationale: Narrows the population.";

fn marker(key: PersonaKey) -> String {
    format!("<<{}>> ", key.as_str())
}

/// Catalogue whose persona texts are recognizable markers
fn marker_catalogue() -> PersonaCatalogue {
    let raw: BTreeMap<String, String> = PersonaKey::ALL
        .iter()
        .map(|k| (k.as_str().to_string(), marker(*k)))
        .collect();
    PersonaCatalogue::from_map(raw).unwrap()
}

/// Answers each prompt with the canned text of the persona it was built from.
struct ScriptedClient {
    answers: BTreeMap<PersonaKey, String>,
    failing: Vec<PersonaKey>,
    calls: Mutex<Vec<(PersonaKey, String)>>,
    total: AtomicUsize,
}

impl ScriptedClient {
    fn new() -> Self {
        let answers = [
            (PersonaKey::QuestionDeveloper, REPHRASE),
            (PersonaKey::DocTitleDeveloper, "\"Aspirin and Stroke in Older Adults\""),
            (PersonaKey::FileTitleDeveloper, "\"aspirin_stroke_older_adults.pdf\""),
            (PersonaKey::IntOrExpDeveloper, "This is an intervention question; use PICO."),
            (PersonaKey::PicoDeveloper, "P: adults over 65. I: aspirin. C: placebo. O: stroke."),
            (PersonaKey::PecoDeveloper, "PECO statement"),
            (PersonaKey::SpiderDeveloper, "SPIDER statement"),
            (PersonaKey::IncExcDeveloper, "Include RCTs. Exclude case reports."),
            (PersonaKey::SearchStratDeveloper, "aspirin AND stroke AND aged"),
            (PersonaKey::DatabaseDeveloper, "PubMed is the most relevant database."),
            (PersonaKey::ListReturner, "['PubMed']"),
            (PersonaKey::DatabaseSearchStratDeveloper, "db strategy"),
            (PersonaKey::PubmedQueryDeveloper, "aspirin[tiab]) AND (stroke[tiab])"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();

        Self {
            answers,
            failing: Vec::new(),
            calls: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
        }
    }

    fn answer(mut self, key: PersonaKey, text: &str) -> Self {
        self.answers.insert(key, text.to_string());
        self
    }

    fn failing(mut self, key: PersonaKey) -> Self {
        self.failing.push(key);
        self
    }

    fn calls_for(&self, key: PersonaKey) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let key = PersonaKey::ALL
            .into_iter()
            .find(|k| request.prompt.contains(&marker(*k)))
            .ok_or_else(|| TransportError::Malformed("unknown persona".to_string()))?;

        self.calls.lock().unwrap().push((key, request.prompt.clone()));

        if self.failing.contains(&key) {
            return Err(TransportError::Api {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        // per-database answers name the database they were asked about
        let text = match key {
            PersonaKey::DatabaseSearchStratDeveloper => {
                let database = request
                    .prompt
                    .split("Database that will be searched: ")
                    .nth(1)
                    .and_then(|rest| rest.lines().next())
                    .unwrap_or_default();
                format!("strategy for {}", database)
            }
            _ => self.answers[&key].clone(),
        };
        Ok(Completion::text(text))
    }
}

/// Delays early calls the longest, so concurrent answers arrive in reverse order.
struct StaggeredClient {
    inner: ScriptedClient,
    width: u64,
    rephrase_calls: AtomicUsize,
    database_calls: AtomicUsize,
}

impl StaggeredClient {
    fn new(inner: ScriptedClient, width: u64) -> Self {
        Self {
            inner,
            width,
            rephrase_calls: AtomicUsize::new(0),
            database_calls: AtomicUsize::new(0),
        }
    }

    async fn stagger(&self, n: usize) {
        let steps = self.width.saturating_sub(n as u64);
        tokio::time::sleep(Duration::from_millis(steps * 15)).await;
    }
}

#[async_trait]
impl CompletionClient for StaggeredClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        if request.prompt.contains(&marker(PersonaKey::QuestionDeveloper)) {
            let n = self.rephrase_calls.fetch_add(1, Ordering::SeqCst);
            self.stagger(n).await;
            return Ok(Completion::text(format!("New Question: Q{}\nRationale: R{}", n, n)));
        }
        if request.prompt.contains(&marker(PersonaKey::DatabaseSearchStratDeveloper)) {
            let n = self.database_calls.fetch_add(1, Ordering::SeqCst);
            self.stagger(n).await;
        }
        self.inner.complete(request).await
    }
}

fn fast_llm() -> LlmConfig {
    LlmConfig {
        retry_backoff_ms: 0,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

fn pipeline_with(client: Arc<ScriptedClient>, config: PipelineConfig) -> Pipeline {
    Pipeline::new(client, marker_catalogue(), fast_llm(), config).unwrap()
}

fn single_candidate() -> PipelineConfig {
    PipelineConfig {
        candidate_count: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_run_produces_ordered_summary() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = pipeline_with(client.clone(), single_candidate());

    let report = pipeline
        .run("  Does aspirin prevent stroke?  ", &FirstCandidate)
        .await
        .unwrap();
    let summary = &report.summary;

    let expected_keys = vec![
        keys::OLD_QUESTION.to_string(),
        keys::NEW_QUESTION.to_string(),
        keys::RATIONALE.to_string(),
        keys::DOCUMENT_TITLE.to_string(),
        keys::FILE_TITLE.to_string(),
        keys::CLINICAL_STATEMENT.to_string(),
        keys::POPULATION_STATEMENT.to_string(),
        keys::INCLUSION_EXCLUSION.to_string(),
        keys::SEARCH_STRATEGY.to_string(),
        keys::DATABASES.to_string(),
        keys::database_strategy("PubMed"),
        keys::ALL_DATABASE_STRATEGY.to_string(),
        keys::PUBMED_QUERY.to_string(),
    ];
    assert_eq!(summary.keys().map(str::to_string).collect::<Vec<_>>(), expected_keys);

    assert_eq!(summary.get(keys::OLD_QUESTION), Some("Does aspirin prevent stroke?"));
    assert_eq!(
        summary.get(keys::NEW_QUESTION),
        Some("Does aspirin reduce stroke in adults over 65?")
    );
    assert_eq!(summary.get(keys::RATIONALE), Some("Narrows the population."));
    assert_eq!(summary.get(keys::DOCUMENT_TITLE), Some("Aspirin and Stroke in Older Adults"));
    assert_eq!(summary.get(keys::FILE_TITLE), Some("\"aspirin_stroke_older_adults.pdf\""));
    assert_eq!(
        summary.get(keys::POPULATION_STATEMENT),
        Some("P: adults over 65. I: aspirin. C: placebo. O: stroke.")
    );
    assert_eq!(summary.get(&keys::database_strategy("PubMed")), Some("strategy for PubMed"));
    assert_eq!(
        summary.get(keys::PUBMED_QUERY),
        Some("aspirin[tiab]) AND (stroke[tiab])")
    );

    assert_eq!(report.format, ClinicalFormat::Pico);
    assert_eq!(report.databases, vec!["PubMed".to_string()]);
    assert_eq!(report.selected, 0);

    // 1 rephrase + 9 single stages + 1 per-database call
    assert_eq!(client.total.load(Ordering::SeqCst), 11);
}

#[tokio::test]
async fn test_prompts_carry_seeded_context() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = pipeline_with(client.clone(), single_candidate());
    pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap();

    let new_question = "Does aspirin reduce stroke in adults over 65?";

    let doc_title = &client.calls_for(PersonaKey::DocTitleDeveloper)[0];
    assert_eq!(
        doc_title,
        &format!(
            "Question: {}{}\nDocument Title:\n\nAnswer:",
            marker(PersonaKey::DocTitleDeveloper),
            new_question
        )
    );

    let list = &client.calls_for(PersonaKey::ListReturner)[0];
    assert!(list.contains("PubMed is the most relevant database.\nList:('"));

    let pubmed = &client.calls_for(PersonaKey::PubmedQueryDeveloper)[0];
    assert!(pubmed.contains("aspirin AND stroke AND aged\n Pubmed Query: ("));
}

#[tokio::test]
async fn test_per_database_strategies_in_list_order() {
    let client = Arc::new(ScriptedClient::new().answer(PersonaKey::ListReturner, "['PubMed', 'Embase']"));
    let pipeline = pipeline_with(client.clone(), single_candidate());

    let report = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap();

    assert_eq!(client.calls_for(PersonaKey::DatabaseSearchStratDeveloper).len(), 2);
    assert_eq!(
        report.summary.get(&keys::database_strategy("PubMed")),
        Some("strategy for PubMed")
    );
    assert_eq!(
        report.summary.get(&keys::database_strategy("Embase")),
        Some("strategy for Embase")
    );

    let all = report.summary.get(keys::ALL_DATABASE_STRATEGY).unwrap();
    let pubmed = all.find("Strategy for PubMed").unwrap();
    let embase = all.find("Strategy for Embase").unwrap();
    assert!(pubmed < embase);
}

#[tokio::test]
async fn test_spider_branch_uses_spider_persona() {
    let client = Arc::new(
        ScriptedClient::new().answer(PersonaKey::IntOrExpDeveloper, "A qualitative SPIDER question"),
    );
    let pipeline = pipeline_with(client.clone(), single_candidate());

    let report = pipeline.run("How do carers experience respite?", &FirstCandidate).await.unwrap();

    assert_eq!(report.format, ClinicalFormat::Spider);
    assert_eq!(report.summary.get(keys::POPULATION_STATEMENT), Some("SPIDER statement"));
    assert!(client.calls_for(PersonaKey::PicoDeveloper).is_empty());
    assert_eq!(client.calls_for(PersonaKey::SpiderDeveloper).len(), 1);
}

#[tokio::test]
async fn test_all_rephrase_failures_surface_transport_error() {
    let client = Arc::new(ScriptedClient::new().failing(PersonaKey::QuestionDeveloper));
    let config = PipelineConfig {
        candidate_count: 3,
        ..Default::default()
    };
    let pipeline = pipeline_with(client.clone(), config);

    let err = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap_err();

    assert!(matches!(err, StrategyError::CompletionTransport { .. }));
    assert_eq!(err.stage(), Some("Rephrase"));
    // each candidate is tried twice, nothing after stage 1 runs
    assert_eq!(client.total.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_unparseable_candidates_are_no_usable_candidates() {
    let client = Arc::new(ScriptedClient::new().answer(PersonaKey::QuestionDeveloper, "I cannot help with that."));
    let pipeline = pipeline_with(client, single_candidate());

    let err = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap_err();
    assert!(matches!(err, StrategyError::NoUsableCandidates { attempted: 1 }));
}

#[tokio::test]
async fn test_duplicate_candidates_collapse() {
    let client = Arc::new(ScriptedClient::new());
    let config = PipelineConfig {
        candidate_count: 4,
        ..Default::default()
    };
    let pipeline = pipeline_with(client, config);

    let report = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap();
    assert_eq!(report.candidates.len(), 1);
}

#[tokio::test]
async fn test_out_of_range_selection_fails() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = pipeline_with(client, single_candidate());

    let err = pipeline.run("Does aspirin prevent stroke?", &IndexSelector(3)).await.unwrap_err();
    assert!(matches!(err, StrategyError::Selection(_)));
}

#[tokio::test]
async fn test_classification_failure_stops_run() {
    let client = Arc::new(
        ScriptedClient::new().answer(PersonaKey::IntOrExpDeveloper, "Use a cohort design."),
    );
    let pipeline = pipeline_with(client.clone(), single_candidate());

    let err = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap_err();

    assert!(matches!(err, StrategyError::Classification(_)));
    assert_eq!(err.stage(), Some("Classify"));
    assert!(client.calls_for(PersonaKey::IncExcDeveloper).is_empty());
}

#[tokio::test]
async fn test_database_list_parse_failure_is_fatal_by_default() {
    let client = Arc::new(
        ScriptedClient::new().answer(PersonaKey::ListReturner, "I would search several databases"),
    );
    let pipeline = pipeline_with(client.clone(), single_candidate());

    let err = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap_err();

    assert!(matches!(err, StrategyError::DatabaseListParse(_)));
    assert!(client.calls_for(PersonaKey::PubmedQueryDeveloper).is_empty());
}

#[tokio::test]
async fn test_database_list_parse_failure_can_be_skipped() {
    let client = Arc::new(
        ScriptedClient::new().answer(PersonaKey::ListReturner, "__import__('os').system('ls')"),
    );
    let config = PipelineConfig {
        candidate_count: 1,
        allow_empty_database_list: true,
        ..Default::default()
    };
    let pipeline = pipeline_with(client.clone(), config);

    let report = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap();

    assert!(report.databases.is_empty());
    assert!(client.calls_for(PersonaKey::DatabaseSearchStratDeveloper).is_empty());
    assert_eq!(
        report.summary.get(keys::ALL_DATABASE_STRATEGY),
        Some("Search Strategy for all databases:\n")
    );
    assert!(report.summary.get(keys::PUBMED_QUERY).is_some());
}

#[tokio::test]
async fn test_empty_question_rejected_without_calls() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = pipeline_with(client.clone(), single_candidate());

    let err = pipeline.run("   ", &FirstCandidate).await.unwrap_err();

    assert!(matches!(err, StrategyError::EmptyQuestion));
    assert_eq!(client.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_run_returns_cancelled() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = pipeline_with(client.clone(), single_candidate());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .run_with_cancel("Does aspirin prevent stroke?", &FirstCandidate, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, StrategyError::Cancelled { .. }));
    assert_eq!(client.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_progress_reports_stages_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        move |stage: Stage| seen.lock().unwrap().push(stage)
    };

    let client = Arc::new(ScriptedClient::new());
    let pipeline = pipeline_with(client, single_candidate()).with_progress(Arc::new(sink));
    pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Stage::Rephrase,
            Stage::Deduplicate,
            Stage::Select,
            Stage::Extract,
            Stage::DocumentTitle,
            Stage::FileTitle,
            Stage::Classify,
            Stage::PopulationStatement,
            Stage::InclusionExclusion,
            Stage::SearchStrategy,
            Stage::DatabaseEnumeration,
            Stage::DatabaseListParse,
            Stage::PerDatabaseStrategy,
            Stage::PubmedQuery,
            Stage::Finalize,
        ]
    );
}

#[test]
fn test_invalid_catalogue_fails_before_any_call() {
    let mut raw: BTreeMap<String, String> = PersonaKey::ALL
        .iter()
        .map(|k| (k.as_str().to_string(), marker(*k)))
        .collect();
    raw.remove(PersonaKey::PicoDeveloper.as_str());

    let err = PersonaCatalogue::from_map(raw).unwrap_err();
    assert!(matches!(err, StrategyError::Configuration(ref msg) if msg.contains("PICO_developer")));
}

#[tokio::test]
async fn test_run_can_be_spawned() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = Arc::new(pipeline_with(client, single_candidate()));

    let handle = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await }
    });

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.summary.len(), 13);
}

#[tokio::test]
async fn test_concurrent_results_keep_request_order() {
    let databases = ["PubMed", "Embase", "CINAHL", "PsycINFO"];
    let inner = ScriptedClient::new().answer(
        PersonaKey::ListReturner,
        "['PubMed', 'Embase', 'CINAHL', 'PsycINFO']",
    );
    let client = Arc::new(StaggeredClient::new(inner, 4));
    let config = PipelineConfig {
        candidate_count: 4,
        max_concurrency: 4,
        ..Default::default()
    };
    let pipeline = Pipeline::new(client, marker_catalogue(), fast_llm(), config).unwrap();

    let report = pipeline.run("Does aspirin prevent stroke?", &FirstCandidate).await.unwrap();

    let questions: Vec<&str> = report.candidates.iter().map(|c| c.question.as_str()).collect();
    assert_eq!(questions, vec!["Q0", "Q1", "Q2", "Q3"]);
    assert_eq!(report.summary.get(keys::NEW_QUESTION), Some("Q0"));

    let database_keys: Vec<&str> = report
        .summary
        .keys()
        .filter(|k| k.starts_with("Search strategy specific to "))
        .collect();
    let expected: Vec<String> = databases.iter().map(|d| keys::database_strategy(d)).collect();
    assert_eq!(database_keys, expected);
    for database in databases {
        assert_eq!(
            report.summary.get(&keys::database_strategy(database)),
            Some(format!("strategy for {}", database).as_str())
        );
    }

    let all = report.summary.get(keys::ALL_DATABASE_STRATEGY).unwrap();
    let positions: Vec<usize> = databases
        .iter()
        .map(|d| all.find(&format!("Strategy for {}:", d)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}
