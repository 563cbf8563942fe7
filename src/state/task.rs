use crate::crawler::PagingState;
use crate::state::{Stage, StageState};
use crate::{HarvestError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// One harvest job: a keyword query and the progress of both of its stages
///
/// Tasks are created once and never deleted; their row is what a restarted
/// process reads to decide where to pick up.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub keywords: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub discovery_state: StageState,
    pub content_state: StageState,
    pub total_parents: u64,
    pub processed_parents: u64,
    pub total_children: u64,
    pub processed_children: u64,
    pub last_error: Option<String>,
    /// Paging position of the last discovery page that was committed
    pub discovery_checkpoint: PagingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task with both stages `not_started`
    pub fn new(
        keywords: impl Into<String>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            keywords: keywords.into(),
            start_date,
            end_date,
            discovery_state: StageState::NotStarted,
            content_state: StageState::NotStarted,
            total_parents: 0,
            processed_parents: 0,
            total_children: 0,
            processed_children: 0,
            last_error: None,
            discovery_checkpoint: PagingState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_state(&self, stage: Stage) -> StageState {
        match stage {
            Stage::Discovery => self.discovery_state,
            Stage::Content => self.content_state,
        }
    }

    /// Moves `stage` to `to`, enforcing the transition table
    ///
    /// The content stage can only become `in_progress` or `completed` once
    /// discovery has completed.
    pub fn transition(&mut self, stage: Stage, to: StageState) -> Result<()> {
        let from = self.stage_state(stage);
        if !from.can_transition_to(to) {
            return Err(HarvestError::InvalidTransition { stage, from, to });
        }

        if stage == Stage::Content
            && matches!(to, StageState::InProgress | StageState::Completed)
            && !self.discovery_state.is_completed()
        {
            return Err(HarvestError::DiscoveryIncomplete {
                task_id: self.id.clone(),
            });
        }

        match stage {
            Stage::Discovery => self.discovery_state = to,
            Stage::Content => self.content_state = to,
        }
        if to != StageState::Failed {
            self.last_error = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enters (or re-enters) `stage`
    pub fn begin_stage(&mut self, stage: Stage) -> Result<()> {
        self.transition(stage, StageState::InProgress)
    }

    pub fn complete_stage(&mut self, stage: Stage) -> Result<()> {
        self.transition(stage, StageState::Completed)
    }

    /// Marks `stage` failed and records the error that caused it
    pub fn fail_stage(&mut self, stage: Stage, error: impl Into<String>) -> Result<()> {
        self.transition(stage, StageState::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// True when both stages have completed
    pub fn is_done(&self) -> bool {
        self.discovery_state.is_completed() && self.content_state.is_completed()
    }
}

/// What a restarted process should do with an existing task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    /// Nothing has run yet
    StartFresh,
    /// Discovery did not finish; continue it from its checkpoint
    ResumeDiscovery,
    /// Discovery is complete; collect content for unprocessed parents
    ResumeContent,
    /// Both stages completed
    AlreadyDone,
}

/// Decides how to resume a task from its persisted stage states
///
/// Content collection is never resumed against an incomplete discovery set.
pub fn determine_resume_strategy(task: &Task) -> ResumeStrategy {
    match task.discovery_state {
        StageState::NotStarted => ResumeStrategy::StartFresh,
        StageState::InProgress | StageState::Failed => ResumeStrategy::ResumeDiscovery,
        StageState::Completed if !task.content_state.is_completed() => {
            ResumeStrategy::ResumeContent
        }
        StageState::Completed => ResumeStrategy::AlreadyDone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(discovery: StageState, content: StageState) -> Task {
        let mut task = Task::new("rust async", None, None);
        task.discovery_state = discovery;
        task.content_state = content;
        task
    }

    #[test]
    fn test_new_task_starts_fresh() {
        let task = Task::new("rust", None, None);
        assert_eq!(task.discovery_state, StageState::NotStarted);
        assert_eq!(task.content_state, StageState::NotStarted);
        assert_eq!(determine_resume_strategy(&task), ResumeStrategy::StartFresh);
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_discovery_in_progress_never_resumes_content() {
        for content in StageState::all_states() {
            let task = task_with(StageState::InProgress, content);
            assert_eq!(
                determine_resume_strategy(&task),
                ResumeStrategy::ResumeDiscovery,
                "content state {:?}",
                content
            );
        }
    }

    #[test]
    fn test_failed_discovery_resumes_discovery() {
        let task = task_with(StageState::Failed, StageState::NotStarted);
        assert_eq!(
            determine_resume_strategy(&task),
            ResumeStrategy::ResumeDiscovery
        );
    }

    #[test]
    fn test_resume_content_and_done() {
        let task = task_with(StageState::Completed, StageState::NotStarted);
        assert_eq!(determine_resume_strategy(&task), ResumeStrategy::ResumeContent);

        let task = task_with(StageState::Completed, StageState::Failed);
        assert_eq!(determine_resume_strategy(&task), ResumeStrategy::ResumeContent);

        let task = task_with(StageState::Completed, StageState::Completed);
        assert_eq!(determine_resume_strategy(&task), ResumeStrategy::AlreadyDone);
        assert!(task.is_done());
    }

    #[test]
    fn test_content_requires_completed_discovery() {
        let mut task = Task::new("rust", None, None);
        task.begin_stage(Stage::Discovery).unwrap();

        let err = task.begin_stage(Stage::Content).unwrap_err();
        assert!(matches!(err, HarvestError::DiscoveryIncomplete { .. }));
        assert_eq!(task.content_state, StageState::NotStarted);

        task.complete_stage(Stage::Discovery).unwrap();
        task.begin_stage(Stage::Content).unwrap();
        task.complete_stage(Stage::Content).unwrap();
        assert!(task.is_done());
    }

    #[test]
    fn test_fail_records_error_and_resume_clears_it() {
        let mut task = Task::new("rust", None, None);
        task.begin_stage(Stage::Discovery).unwrap();
        task.fail_stage(Stage::Discovery, "pool exhausted").unwrap();

        assert_eq!(task.discovery_state, StageState::Failed);
        assert_eq!(task.last_error.as_deref(), Some("pool exhausted"));

        task.begin_stage(Stage::Discovery).unwrap();
        assert_eq!(task.discovery_state, StageState::InProgress);
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut task = Task::new("rust", None, None);
        let err = task.complete_stage(Stage::Discovery).unwrap_err();
        assert!(matches!(
            err,
            HarvestError::InvalidTransition {
                stage: Stage::Discovery,
                from: StageState::NotStarted,
                to: StageState::Completed,
            }
        ));
    }
}
