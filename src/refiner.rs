//! Question refinement.
//!
//! Generates K rephrasings of the user's question, drops the ones that do not
//! parse, removes exact duplicates of the raw completion text and hands the
//! remaining pool to a [`SelectionStrategy`].

use crate::completion::Completer;
use crate::error::{Result, StrategyError};
use crate::extract::{extract_new_question_and_rationale, RefinedQuestion};
use crate::pipeline::{ProgressSink, Stage};
use futures::stream::{self, StreamExt};
use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// One rephrasing that passed extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Raw completion text, the identity used for deduplication
    pub raw: String,
    /// Extracted question, for display
    pub question: String,
}

/// Picks one candidate out of the deduplicated pool.
pub trait SelectionStrategy: Send + Sync {
    /// Index into `candidates` (never called with an empty slice)
    fn choose(&self, candidates: &[Candidate]) -> Result<usize>;
}

/// Always picks the first candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCandidate;

impl SelectionStrategy for FirstCandidate {
    fn choose(&self, _candidates: &[Candidate]) -> Result<usize> {
        Ok(0)
    }
}

/// Picks a fixed zero-based index
#[derive(Debug, Clone, Copy)]
pub struct IndexSelector(pub usize);

impl SelectionStrategy for IndexSelector {
    fn choose(&self, candidates: &[Candidate]) -> Result<usize> {
        if self.0 < candidates.len() {
            Ok(self.0)
        } else {
            Err(StrategyError::Selection(format!(
                "option {} requested but only {} candidates exist",
                self.0 + 1,
                candidates.len()
            )))
        }
    }
}

/// Delegates the choice to a closure, e.g. a UI callback
pub struct FnSelector<F>(pub F);

impl<F> SelectionStrategy for FnSelector<F>
where
    F: Fn(&[Candidate]) -> Result<usize> + Send + Sync,
{
    fn choose(&self, candidates: &[Candidate]) -> Result<usize> {
        (self.0)(candidates)
    }
}

/// Numbered console prompt.
///
/// Re-prompts on invalid input; end of input is a selection error.
pub struct InteractiveSelector<R, W> {
    io: Mutex<(R, W)>,
}

impl InteractiveSelector<BufReader<std::io::Stdin>, std::io::Stdout> {
    /// Prompt on stdout, read from stdin
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> InteractiveSelector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }

    fn prompt(&self, candidates: &[Candidate]) -> std::io::Result<Option<usize>> {
        let mut guard = self
            .io
            .lock()
            .map_err(|_| std::io::Error::other("selector lock poisoned"))?;
        let (input, output) = &mut *guard;

        for (i, candidate) in candidates.iter().enumerate() {
            writeln!(output, "Option {}: {}", i + 1, candidate.question)?;
        }

        loop {
            write!(output, "Which question do you prefer? (1-{}) ", candidates.len())?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            match line.trim().parse::<usize>() {
                Ok(n) if (1..=candidates.len()).contains(&n) => {
                    writeln!(output, "You chose option {}: {}", n, candidates[n - 1].question)?;
                    return Ok(Some(n - 1));
                }
                _ => writeln!(output, "Please enter a number between 1 and {}.", candidates.len())?,
            }
        }
    }
}

impl<R, W> SelectionStrategy for InteractiveSelector<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn choose(&self, candidates: &[Candidate]) -> Result<usize> {
        self.prompt(candidates)?
            .ok_or_else(|| StrategyError::Selection("input closed before a choice was made".to_string()))
    }
}

/// Remove exact duplicates, keeping the first occurrence of each.
pub fn dedupe<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut unique: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

/// Result of the rephrase/deduplicate/select/extract sequence
#[derive(Debug, Clone)]
pub struct Refinement {
    /// Deduplicated candidate pool in first-seen order
    pub candidates: Vec<Candidate>,
    /// Index of the chosen candidate in `candidates`
    pub selected: usize,
    /// Question and rationale of the chosen candidate
    pub refined: RefinedQuestion,
}

/// Runs stages Rephrase through Extract.
pub struct QuestionRefiner<'a> {
    completer: &'a Completer,
    persona: &'a str,
    candidate_count: usize,
    temperature: f32,
    concurrency: usize,
    progress: Option<&'a dyn ProgressSink>,
}

impl<'a> QuestionRefiner<'a> {
    pub fn new(completer: &'a Completer, persona: &'a str) -> Self {
        Self {
            completer,
            persona,
            candidate_count: crate::config::DEFAULT_CANDIDATE_COUNT,
            temperature: crate::config::DEFAULT_REPHRASE_TEMPERATURE,
            concurrency: 1,
            progress: None,
        }
    }

    pub fn candidate_count(mut self, count: usize) -> Self {
        self.candidate_count = count;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Report Rephrase, Deduplicate, Select and Extract to `sink`
    pub fn progress(mut self, sink: Option<&'a dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    fn started(&self, stage: Stage) {
        debug!(stage = %stage, "Stage started");
        if let Some(sink) = self.progress {
            sink.stage_started(stage);
        }
    }

    /// Generate candidates, keep the parseable ones, deduplicate by raw text.
    pub async fn generate(&self, question: &str) -> Result<Vec<Candidate>> {
        self.started(Stage::Rephrase);
        info!(
            count = self.candidate_count,
            temperature = self.temperature,
            "Generating question candidates"
        );

        let outcomes: Vec<Result<String>> = stream::iter(0..self.candidate_count)
            .map(|_| {
                self.completer
                    .complete(Stage::Rephrase, question, self.persona, self.temperature)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut parsed = Vec::with_capacity(outcomes.len());
        let mut first_failure = None;

        for (idx, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(raw) => match extract_new_question_and_rationale(&raw, Stage::Rephrase.as_str()) {
                    Ok(refined) => parsed.push(Candidate {
                        raw,
                        question: refined.question,
                    }),
                    Err(e) => debug!(idx, error = %e, "Dropping unparseable candidate"),
                },
                Err(e @ StrategyError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    warn!(idx, error = %e, "Candidate completion failed");
                    first_failure.get_or_insert(e);
                }
            }
        }

        self.started(Stage::Deduplicate);
        let candidates = dedupe(parsed);
        if candidates.is_empty() {
            return Err(first_failure.unwrap_or(StrategyError::NoUsableCandidates {
                attempted: self.candidate_count,
            }));
        }

        info!(unique = candidates.len(), "Question candidates ready");
        Ok(candidates)
    }

    /// Full refinement: generate, select, then extract from the selected candidate.
    pub async fn refine(&self, question: &str, selector: &dyn SelectionStrategy) -> Result<Refinement> {
        let candidates = self.generate(question).await?;

        self.started(Stage::Select);
        let selected = selector.choose(&candidates)?;
        let chosen = candidates.get(selected).ok_or_else(|| {
            StrategyError::Selection(format!(
                "selector returned {} for {} candidates",
                selected,
                candidates.len()
            ))
        })?;
        debug!(selected, "Candidate selected");

        self.started(Stage::Extract);

        let refined = extract_new_question_and_rationale(&chosen.raw, Stage::Extract.as_str())?;

        Ok(Refinement {
            candidates,
            selected,
            refined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completion, CompletionClient, CompletionRequest, TransportError};
    use crate::config::LlmConfig;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Returns its scripted answers in call order, cycling.
    struct Scripted {
        answers: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(&self, _request: &CompletionRequest) -> std::result::Result<Completion, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Completion::text(self.answers[n % self.answers.len()].clone()))
        }
    }

    fn completer(answers: &[&str]) -> Completer {
        let client = Arc::new(Scripted {
            answers: answers.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        let config = LlmConfig {
            retry_backoff_ms: 0,
            ..Default::default()
        };
        Completer::new(client, &config, CancellationToken::new())
    }

    fn candidate(q: &str) -> Candidate {
        Candidate {
            raw: format!("New Question: {q}\nRationale: r"),
            question: q.to_string(),
        }
    }

    #[test]
    fn test_dedupe_preserves_first_seen_order() {
        assert_eq!(dedupe(vec!["A", "B", "A", "C"]), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let once = dedupe(vec!["x", "y", "x", "y", "z"]);
        assert_eq!(dedupe(once.clone()), once);
    }

    #[test]
    fn test_dedupe_uses_raw_text() {
        let a = Candidate {
            raw: "New Question: Q\nRationale: one".to_string(),
            question: "Q".to_string(),
        };
        let b = Candidate {
            raw: "New Question: Q\nRationale: two".to_string(),
            question: "Q".to_string(),
        };
        assert_eq!(dedupe(vec![a.clone(), b.clone(), a.clone()]), vec![a, b]);
    }

    #[test]
    fn test_index_selector_bounds() {
        let pool = vec![candidate("a"), candidate("b")];
        assert_eq!(IndexSelector(1).choose(&pool).unwrap(), 1);
        assert!(matches!(IndexSelector(2).choose(&pool), Err(StrategyError::Selection(_))));
    }

    #[test]
    fn test_interactive_selector_reprompts() {
        let pool = vec![candidate("first"), candidate("second")];
        let input = Cursor::new("7\nabc\n2\n");
        let mut output = Vec::new();
        let choice = {
            let selector = InteractiveSelector::new(input, &mut output);
            selector.choose(&pool).unwrap()
        };
        assert_eq!(choice, 1);

        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("Option 1: first"));
        assert!(shown.contains("Option 2: second"));
        assert_eq!(shown.matches("Which question do you prefer? (1-2)").count(), 3);
    }

    #[test]
    fn test_interactive_selector_eof() {
        let pool = vec![candidate("only")];
        let selector = InteractiveSelector::new(Cursor::new(""), Vec::new());
        assert!(matches!(selector.choose(&pool), Err(StrategyError::Selection(_))));
    }

    #[tokio::test]
    async fn test_generate_drops_unparseable_and_duplicates() {
        let completer = completer(&[
            "New Question: A\nRationale: ra",
            "I cannot help with that.",
            "New Question: A\nRationale: ra",
            "New Question: B\nRationale: rb",
        ]);
        let refiner = QuestionRefiner::new(&completer, "p").candidate_count(4).concurrency(3);

        let pool = refiner.generate("q").await.unwrap();
        assert_eq!(pool.iter().map(|c| c.question.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_all_unparseable_is_fatal() {
        let completer = completer(&["no markers here"]);
        let refiner = QuestionRefiner::new(&completer, "p").candidate_count(3);

        let err = refiner.generate("q").await.unwrap_err();
        assert!(matches!(err, StrategyError::NoUsableCandidates { attempted: 3 }));
    }

    #[tokio::test]
    async fn test_refine_extracts_selected_candidate() {
        let completer = completer(&[
            "New Question: A\nRationale: ra",
            "New Question: B\nRationale: rb",
        ]);
        let refiner = QuestionRefiner::new(&completer, "p").candidate_count(2);

        let refinement = refiner.refine("q", &IndexSelector(1)).await.unwrap();
        assert_eq!(refinement.selected, 1);
        assert_eq!(refinement.refined.question, "B");
        assert_eq!(refinement.refined.rationale, "rb");
    }

    #[tokio::test]
    async fn test_out_of_range_selection() {
        let completer = completer(&["New Question: A\nRationale: ra"]);
        let refiner = QuestionRefiner::new(&completer, "p").candidate_count(1);
        let selector = FnSelector(|_: &[Candidate]| -> Result<usize> { Ok(5) });

        let err = refiner.refine("q", &selector).await.unwrap_err();
        assert!(matches!(err, StrategyError::Selection(_)));
    }

    #[tokio::test]
    async fn test_refine_reports_each_stage() {
        let seen = Mutex::new(Vec::new());
        let sink = |stage: Stage| seen.lock().unwrap().push(stage);
        let completer = completer(&["New Question: A\nRationale: ra"]);

        QuestionRefiner::new(&completer, "p")
            .candidate_count(2)
            .progress(Some(&sink))
            .refine("q", &FirstCandidate)
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Stage::Rephrase, Stage::Deduplicate, Stage::Select, Stage::Extract]
        );
    }
}
