//! Search strategy pipeline orchestrator.
//!
//! Runs the stage sequence from a free-text research question to a complete
//! [`RunSummary`]. Every stage is one completion conditioned on a persona and
//! the context produced by the stages before it. The only branch is the
//! population-statement persona, chosen by the classification stage.
//!
//! A run either returns the full summary or a single classified error naming
//! the stage it failed at; partial summaries are never handed out.

use crate::completion::{Completer, CompletionClient, OpenAiClient, TokenUsage};
use crate::config::{LlmConfig, PipelineConfig, StrategyConfig};
use crate::error::{Result, StrategyError};
use crate::extract::{classify, clean_title, parse_database_list, ClinicalFormat};
use crate::personas::{PersonaCatalogue, PersonaKey};
use crate::refiner::{Candidate, QuestionRefiner, SelectionStrategy};
use crate::summary::{keys, RunSummary};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Rephrase,
    Deduplicate,
    Select,
    Extract,
    DocumentTitle,
    FileTitle,
    Classify,
    PopulationStatement,
    InclusionExclusion,
    SearchStrategy,
    DatabaseEnumeration,
    DatabaseListParse,
    PerDatabaseStrategy,
    PubmedQuery,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Rephrase => "Rephrase",
            Stage::Deduplicate => "Deduplicate",
            Stage::Select => "Select",
            Stage::Extract => "Extract",
            Stage::DocumentTitle => "Document Title",
            Stage::FileTitle => "File Title",
            Stage::Classify => "Classify",
            Stage::PopulationStatement => "Population Statement",
            Stage::InclusionExclusion => "Inclusion/Exclusion Criteria",
            Stage::SearchStrategy => "Search Strategy",
            Stage::DatabaseEnumeration => "Database Enumeration",
            Stage::DatabaseListParse => "Database List Parse",
            Stage::PerDatabaseStrategy => "Per-Database Strategy",
            Stage::PubmedQuery => "PubMed Query",
            Stage::Finalize => "Finalize",
        }
    }

    /// User-facing progress line shown when the stage starts
    pub fn progress_message(&self) -> &'static str {
        match self {
            Stage::Rephrase => "Developing new research questions...",
            Stage::Deduplicate => "Removing repeated questions...",
            Stage::Select => "Selecting research question...",
            Stage::Extract => "Reading selected question...",
            Stage::DocumentTitle => "Developing document title...",
            Stage::FileTitle => "Developing file title...",
            Stage::Classify => "Determining which population statement template to use...",
            Stage::PopulationStatement => "Developing population statement...",
            Stage::InclusionExclusion => "Developing inclusion and exclusion criteria...",
            Stage::SearchStrategy => "Developing search strategy...",
            Stage::DatabaseEnumeration => "Determining which databases to search...",
            Stage::DatabaseListParse => "Reading database list...",
            Stage::PerDatabaseStrategy => "Developing search strategy for each database...",
            Stage::PubmedQuery => "Developing PubMed query...",
            Stage::Finalize => "Search strategy complete.",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives a notification when each stage starts.
pub trait ProgressSink: Send + Sync {
    fn stage_started(&self, stage: Stage);
}

impl<F> ProgressSink for F
where
    F: Fn(Stage) + Send + Sync,
{
    fn stage_started(&self, stage: Stage) {
        self(stage)
    }
}

/// Everything a completed run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Deduplicated rephrasing candidates
    pub candidates: Vec<Candidate>,
    /// Index of the selected candidate
    pub selected: usize,
    pub format: ClinicalFormat,
    /// Parsed database list, in model order
    pub databases: Vec<String>,
    pub usage: TokenUsage,
}

/// The stage orchestrator.
///
/// Holds the immutable run configuration; each call to [`Pipeline::run`] gets
/// its own completer, summary and cancellation token.
pub struct Pipeline {
    client: Arc<dyn CompletionClient>,
    personas: Arc<PersonaCatalogue>,
    llm: LlmConfig,
    config: PipelineConfig,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl Pipeline {
    /// Create a pipeline. Fails before any call if the configuration is invalid.
    pub fn new(
        client: Arc<dyn CompletionClient>,
        personas: PersonaCatalogue,
        llm: LlmConfig,
        config: PipelineConfig,
    ) -> Result<Self> {
        llm.validate()?;
        config.validate()?;
        Ok(Self {
            client,
            personas: Arc::new(personas),
            llm,
            config,
            progress: None,
        })
    }

    /// Pipeline over the OpenAI-compatible client described by `config`
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        config.validate()?;
        let client = OpenAiClient::new(&config.llm)?;
        Self::new(
            Arc::new(client),
            config.personas.clone(),
            config.llm.clone(),
            config.pipeline.clone(),
        )
    }

    /// Report stage starts to `sink`
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Run to completion with a fresh cancellation token
    pub async fn run(&self, question: &str, selector: &dyn SelectionStrategy) -> Result<RunReport> {
        self.run_with_cancel(question, selector, CancellationToken::new()).await
    }

    /// Run until completion, failure or cancellation of `cancel`.
    pub async fn run_with_cancel(
        &self,
        question: &str,
        selector: &dyn SelectionStrategy,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let question = question.trim();
        if question.is_empty() {
            return Err(StrategyError::EmptyQuestion);
        }

        let completer = Completer::new(Arc::clone(&self.client), &self.llm, cancel);
        let mut summary = RunSummary::new();

        info!(question = %question, model = %self.llm.model, "Starting search strategy run");

        // Stages 1-4: rephrase, deduplicate, select, extract
        let refinement = QuestionRefiner::new(&completer, self.persona(PersonaKey::QuestionDeveloper))
            .candidate_count(self.config.candidate_count)
            .temperature(self.config.rephrase_temperature)
            .concurrency(self.config.concurrency())
            .progress(self.progress.as_deref())
            .refine(question, selector)
            .await?;
        let new_question = refinement.refined.question.as_str();

        summary.insert(keys::OLD_QUESTION, question);
        summary.insert(keys::NEW_QUESTION, new_question);
        summary.insert(keys::RATIONALE, refinement.refined.rationale.as_str());

        let document_title = self
            .stage(
                &completer,
                Stage::DocumentTitle,
                PersonaKey::DocTitleDeveloper,
                &format!("{}\nDocument Title:", new_question),
            )
            .await?;
        summary.insert(keys::DOCUMENT_TITLE, clean_title(&document_title));

        let file_title = self
            .stage(
                &completer,
                Stage::FileTitle,
                PersonaKey::FileTitleDeveloper,
                &format!("{}\nFile Title:", new_question),
            )
            .await?;
        summary.insert(keys::FILE_TITLE, file_title);

        let clinical_statement = self
            .stage(&completer, Stage::Classify, PersonaKey::IntOrExpDeveloper, new_question)
            .await?;
        let format = classify(&clinical_statement)?;
        info!(format = %format, "Population statement template chosen");
        summary.insert(keys::CLINICAL_STATEMENT, clinical_statement);

        let population = self
            .stage(&completer, Stage::PopulationStatement, format.persona_key(), new_question)
            .await?;
        summary.insert(keys::POPULATION_STATEMENT, population.as_str());

        let criteria = self
            .stage(
                &completer,
                Stage::InclusionExclusion,
                PersonaKey::IncExcDeveloper,
                &format!("{}\nMy Research Question: {}", population, new_question),
            )
            .await?;
        summary.insert(keys::INCLUSION_EXCLUSION, criteria.as_str());

        let strategy = self
            .stage(
                &completer,
                Stage::SearchStrategy,
                PersonaKey::SearchStratDeveloper,
                &format!(
                    "My Research Question: {}\nPopulation Statement: {}\n{}\n\nFinal Search Strategy:",
                    new_question, population, criteria
                ),
            )
            .await?;
        summary.insert(keys::SEARCH_STRATEGY, strategy.as_str());

        let database_answer = self
            .stage(
                &completer,
                Stage::DatabaseEnumeration,
                PersonaKey::DatabaseDeveloper,
                &format!("{}\nList of databases:", new_question),
            )
            .await?;
        summary.insert(keys::DATABASES, database_answer.as_str());

        let databases = self.database_list(&completer, &database_answer).await?;

        self.started(Stage::PerDatabaseStrategy);
        info!(count = databases.len(), "Developing per-database strategies");
        let per_database = self.per_database(&completer, &strategy, &databases).await?;

        let mut all_strategies = String::new();
        for (database, text) in databases.iter().zip(per_database) {
            all_strategies.push_str(&format!("\nStrategy for {}:\n{}\n", database, text));
            summary.insert(keys::database_strategy(database), text);
        }
        summary.insert(
            keys::ALL_DATABASE_STRATEGY,
            format!("Search Strategy for all databases:\n{}", all_strategies),
        );

        let pubmed = self
            .stage(
                &completer,
                Stage::PubmedQuery,
                PersonaKey::PubmedQueryDeveloper,
                &format!("{}\n Pubmed Query: (", strategy),
            )
            .await?;
        summary.insert(keys::PUBMED_QUERY, pubmed);

        self.started(Stage::Finalize);
        let usage = completer.usage();
        info!(
            entries = summary.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Search strategy run complete"
        );

        Ok(RunReport {
            summary,
            candidates: refinement.candidates,
            selected: refinement.selected,
            format,
            databases,
            usage,
        })
    }

    /// One single-completion stage at the stage temperature
    async fn stage(
        &self,
        completer: &Completer,
        stage: Stage,
        persona: PersonaKey,
        context: &str,
    ) -> Result<String> {
        self.started(stage);
        let text = completer
            .complete(stage, context, self.persona(persona), self.config.stage_temperature)
            .await?;
        debug!(stage = %stage, chars = text.len(), "Stage complete");
        Ok(text)
    }

    /// Ask the model to restate its database answer as a literal list, then parse it.
    async fn database_list(&self, completer: &Completer, database_answer: &str) -> Result<Vec<String>> {
        let raw = self
            .stage(
                completer,
                Stage::DatabaseListParse,
                PersonaKey::ListReturner,
                &format!("{}\nList:('", database_answer),
            )
            .await?;

        match parse_database_list(&raw) {
            Ok(databases) => {
                info!(databases = ?databases, "Database list parsed");
                Ok(databases)
            }
            Err(e) if self.config.allow_empty_database_list => {
                warn!(error = %e, "Continuing without per-database strategies");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Per-database completions, issued concurrently and returned in list order.
    async fn per_database(
        &self,
        completer: &Completer,
        strategy: &str,
        databases: &[String],
    ) -> Result<Vec<String>> {
        let persona = self.persona(PersonaKey::DatabaseSearchStratDeveloper);
        let temperature = self.config.stage_temperature;

        // contexts are owned so the run future stays Send
        let contexts: Vec<String> = databases
            .iter()
            .map(|database| {
                format!(
                    "My Search Strategy: {}\nDatabase that will be searched: {}\nSearch strategy specific to {}:",
                    strategy, database, database
                )
            })
            .collect();

        let outcomes: Vec<Result<String>> = stream::iter(contexts)
            .map(|context| async move {
                completer
                    .complete(Stage::PerDatabaseStrategy, &context, persona, temperature)
                    .await
            })
            .buffered(self.config.concurrency())
            .collect()
            .await;

        outcomes.into_iter().collect()
    }

    fn persona(&self, key: PersonaKey) -> &str {
        self.personas.get(key)
    }

    fn started(&self, stage: Stage) {
        debug!(stage = %stage, "Stage started");
        if let Some(sink) = &self.progress {
            sink.stage_started(stage);
        }
    }
}

/// Run the whole pipeline against the configured LLM endpoint.
pub async fn run_pipeline(
    question: &str,
    config: &StrategyConfig,
    selector: &dyn SelectionStrategy,
) -> Result<RunSummary> {
    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.run(question, selector).await?;
    Ok(report.summary)
}
