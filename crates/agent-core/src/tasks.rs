//! Task Enforcement
//!
//! Optional supervisory loop around the [`Orchestrator`]: while enforcement
//! is active a turn may not end with tracked tasks still outstanding. The
//! controller re-prompts with a synthetic reminder until the count reaches
//! zero or the user cancels. The model manages tasks through the
//! [`TaskTools`] executor, which shares its store with the controller.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::message::{ContentBlock, Message};
use crate::orchestrator::{Orchestrator, TurnOutcome};
use crate::provider::Iterations;
use crate::tool::{ToolExecutionResult, ToolExecutor, ToolSpec, split_namespaced};

const BRIEFING: &str = "Task enforcement is active for this conversation. Do not end your \
turn while any tracked task is incomplete: work through every outstanding task and mark each \
one complete when it is done. Record work with the tasks__add tool and report progress with \
tasks__update.";

/// Namespace of the built-in task tools
pub const TASK_TOOL_SERVER: &str = "tasks";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl TaskStatus {
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// A tracked task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// Where managed tasks live
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn outstanding(&self) -> Result<Vec<TaskItem>>;
    async fn skipped(&self) -> Result<Vec<TaskItem>>;
    async fn clear(&self) -> Result<()>;
    async fn skip_all(&self) -> Result<()>;
}

/// In-process task list
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<TaskList>,
}

#[derive(Debug, Default)]
struct TaskList {
    items: Vec<TaskItem>,
    next_id: u64,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskList> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a pending task, returning its id. Ids are short counters so the
    /// model can quote them back.
    pub fn add(&self, title: impl Into<String>) -> String {
        let mut list = self.lock();
        list.next_id += 1;
        let id = list.next_id.to_string();
        list.items.push(TaskItem {
            id: id.clone(),
            title: title.into(),
            status: TaskStatus::Pending,
        });
        id
    }

    /// Returns false for unknown ids
    pub fn set_status(&self, id: &str, status: TaskStatus) -> bool {
        let mut list = self.lock();
        let Some(task) = list.items.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        task.status = status;
        true
    }

    pub fn complete_all(&self) {
        for task in self.lock().items.iter_mut().filter(|t| t.status.is_outstanding()) {
            task.status = TaskStatus::Completed;
        }
    }

    pub fn tasks(&self) -> Vec<TaskItem> {
        self.lock().items.clone()
    }

    fn with_status(&self, pred: impl Fn(TaskStatus) -> bool) -> Vec<TaskItem> {
        self.lock().items.iter().filter(|t| pred(t.status)).cloned().collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn outstanding(&self) -> Result<Vec<TaskItem>> {
        Ok(self.with_status(TaskStatus::is_outstanding))
    }

    async fn skipped(&self) -> Result<Vec<TaskItem>> {
        Ok(self.with_status(|s| s == TaskStatus::Skipped))
    }

    async fn clear(&self) -> Result<()> {
        self.lock().items.clear();
        Ok(())
    }

    async fn skip_all(&self) -> Result<()> {
        for task in self.lock().items.iter_mut().filter(|t| t.status.is_outstanding()) {
            task.status = TaskStatus::Skipped;
        }
        Ok(())
    }
}

/// Executor that adds `tasks__add`, `tasks__update` and `tasks__list` to
/// the wrapped executor's tools. Every other call is forwarded.
pub struct TaskTools {
    store: Arc<MemoryTaskStore>,
    inner: Arc<dyn ToolExecutor>,
}

impl TaskTools {
    pub fn new(store: Arc<MemoryTaskStore>, inner: Arc<dyn ToolExecutor>) -> Self {
        Self { store, inner }
    }

    fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new(
                TASK_TOOL_SERVER,
                "add",
                "Track new tasks. Pass `title` for one task or `titles` for several.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "titles": {"type": "array", "items": {"type": "string"}}
                    }
                }),
            ),
            ToolSpec::new(
                TASK_TOOL_SERVER,
                "update",
                "Set the status of a tracked task.",
                json!({
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "status": {"type": "string", "enum": ["pending", "in_progress", "completed", "skipped"]}
                    },
                    "required": ["id", "status"]
                }),
            ),
            ToolSpec::new(
                TASK_TOOL_SERVER,
                "list",
                "List tracked tasks and their status.",
                json!({"type": "object", "properties": {}}),
            ),
        ]
    }

    fn add(&self, input: &Value) -> ToolExecutionResult {
        let titles: Vec<String> = match (&input["title"], &input["titles"]) {
            (Value::String(title), _) => vec![title.clone()],
            (_, Value::Array(titles)) => titles.iter().filter_map(Value::as_str).map(String::from).collect(),
            _ => Vec::new(),
        };
        if titles.iter().all(|t| t.trim().is_empty()) {
            return ToolExecutionResult::error("`title` or `titles` is required");
        }

        let mut text = String::from("Added:");
        for title in titles.into_iter().filter(|t| !t.trim().is_empty()) {
            let id = self.store.add(title.clone());
            let _ = write!(text, "\n- [{id}] {title}");
        }
        ToolExecutionResult::text(text)
    }

    fn update(&self, input: &Value) -> ToolExecutionResult {
        let Some(id) = input["id"].as_str() else {
            return ToolExecutionResult::error("`id` is required");
        };
        let Ok(status) = serde_json::from_value::<TaskStatus>(input["status"].clone()) else {
            return ToolExecutionResult::error("`status` must be pending, in_progress, completed or skipped");
        };
        if self.store.set_status(id, status) {
            ToolExecutionResult::text(format!("Task {id} is now {}", status_label(status)))
        } else {
            ToolExecutionResult::error(format!("No task with id {id}"))
        }
    }

    fn list(&self) -> ToolExecutionResult {
        let tasks = self.store.tasks();
        if tasks.is_empty() {
            return ToolExecutionResult::text("No tasks");
        }
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| format!("[{}] {} ({})", t.id, t.title, status_label(t.status)))
            .collect();
        ToolExecutionResult::text(lines.join("\n"))
    }
}

const fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Skipped => "skipped",
    }
}

#[async_trait]
impl ToolExecutor for TaskTools {
    async fn available_tools(&self) -> Vec<ToolSpec> {
        let mut tools = self.inner.available_tools().await;
        tools.retain(|t| t.server != TASK_TOOL_SERVER);
        tools.extend(Self::specs());
        tools
    }

    async fn execute(&self, name: &str, input: Value) -> ToolExecutionResult {
        match split_namespaced(name) {
            Some((TASK_TOOL_SERVER, "add")) => self.add(&input),
            Some((TASK_TOOL_SERVER, "update")) => self.update(&input),
            Some((TASK_TOOL_SERVER, "list")) => self.list(),
            _ => self.inner.execute(name, input).await,
        }
    }
}

/// What to do with tasks that predate enforcement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingTasks {
    Clear,
    SkipAll,
    /// Keep them; they are restated in the briefing
    Leave,
}

/// What to do once every task is done
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedTasks {
    Clear,
    Leave,
}

/// Caller-supplied decisions
#[async_trait]
pub trait TaskDecider: Send + Sync {
    async fn resolve_existing(&self, outstanding: &[TaskItem], skipped: &[TaskItem]) -> ExistingTasks;

    async fn after_completion(&self) -> FinishedTasks {
        FinishedTasks::Leave
    }
}

/// Fixed answers, for non-interactive drivers
#[derive(Clone, Copy, Debug)]
pub struct FixedDecider {
    pub existing: ExistingTasks,
    pub finished: FinishedTasks,
}

#[async_trait]
impl TaskDecider for FixedDecider {
    async fn resolve_existing(&self, _: &[TaskItem], _: &[TaskItem]) -> ExistingTasks {
        self.existing
    }

    async fn after_completion(&self) -> FinishedTasks {
        self.finished
    }
}

/// Per-conversation enforcement state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnforcementState {
    pub enabled: bool,
    /// The one-time briefing has been sent
    pub briefed: bool,
    pub disposition: Option<ExistingTasks>,
}

pub struct TaskEnforcementController {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn TaskDecider>,
    state: TaskEnforcementState,
    carried: Vec<TaskItem>,
    max_reminders: Iterations,
}

impl TaskEnforcementController {
    pub fn new(store: Arc<dyn TaskStore>, decider: Arc<dyn TaskDecider>) -> Self {
        Self {
            store,
            decider,
            state: TaskEnforcementState::default(),
            carried: Vec::new(),
            max_reminders: Iterations::Unlimited,
        }
    }

    #[must_use]
    pub const fn with_max_reminders(mut self, max: Iterations) -> Self {
        self.max_reminders = max;
        self
    }

    pub const fn state(&self) -> &TaskEnforcementState {
        &self.state
    }

    pub const fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    /// Turn enforcement on, resolving tasks that already exist.
    pub async fn enable(&mut self) -> Result<()> {
        let outstanding = self.store.outstanding().await?;
        let skipped = self.store.skipped().await?;

        self.carried.clear();
        if outstanding.is_empty() && skipped.is_empty() {
            self.store.clear().await?;
            self.state.disposition = None;
        } else {
            let decision = self.decider.resolve_existing(&outstanding, &skipped).await;
            match decision {
                ExistingTasks::Clear => self.store.clear().await?,
                ExistingTasks::SkipAll => self.store.skip_all().await?,
                ExistingTasks::Leave => self.carried = outstanding,
            }
            self.state.disposition = Some(decision);
        }

        self.state.enabled = true;
        self.state.briefed = false;
        tracing::info!(disposition = ?self.state.disposition, "Task enforcement enabled");
        Ok(())
    }

    pub fn disable(&mut self) {
        self.state.enabled = false;
        self.carried.clear();
        tracing::info!("Task enforcement disabled");
    }

    fn briefing(&self) -> String {
        let mut text = BRIEFING.to_string();
        if !self.carried.is_empty() {
            text.push_str("\n\nTasks carried over from before:");
            for task in &self.carried {
                let _ = write!(text, "\n- {}", task.title);
            }
        }
        text
    }

    /// Run one user turn, then keep re-prompting while tasks are outstanding.
    pub async fn run_user_turn(
        &mut self,
        orchestrator: &mut Orchestrator,
        text: &str,
        attachments: Vec<ContentBlock>,
    ) -> Result<TurnOutcome> {
        if !self.state.enabled {
            return orchestrator.process_query(text, attachments).await;
        }

        let briefing = !self.state.briefed;
        let mut messages = Vec::with_capacity(2);
        if briefing {
            messages.push(Message::user(self.briefing()).synthetic());
        }
        messages.push(Message::user(text).with_blocks(attachments));

        let admitted = orchestrator.process_messages(messages).await;
        if briefing && !matches!(admitted, Err(AgentError::Busy)) {
            self.state.briefed = true;
        }
        let mut outcome = admitted?;
        let mut reminders = 0;

        while outcome.completed() {
            let outstanding = self.store.outstanding().await?;
            if outstanding.is_empty() {
                if self.decider.after_completion().await == FinishedTasks::Clear {
                    self.store.clear().await?;
                }
                break;
            }
            if orchestrator.is_cancelled() {
                break;
            }
            if reminders >= self.max_reminders.bound() {
                tracing::warn!(reminders, "Task reminder limit reached");
                break;
            }

            reminders += 1;
            tracing::debug!(outstanding = outstanding.len(), "Re-prompting for outstanding tasks");
            outcome = orchestrator
                .process_message(Message::user(reminder_text(&outstanding)).synthetic())
                .await?;
        }

        Ok(outcome)
    }
}

fn reminder_text(outstanding: &[TaskItem]) -> String {
    let noun = if outstanding.len() == 1 { "task" } else { "tasks" };
    let mut text = format!(
        "You still have {} incomplete {noun}. Continue working until every task is complete:",
        outstanding.len()
    );
    for task in outstanding {
        let _ = write!(text, "\n- [{}] {}", task.id, task.title);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingExecutor, ScriptedAdapter, ScriptedRound};

    struct AskingDecider(ExistingTasks);

    #[async_trait]
    impl TaskDecider for AskingDecider {
        async fn resolve_existing(&self, _: &[TaskItem], _: &[TaskItem]) -> ExistingTasks {
            self.0
        }
    }

    #[tokio::test]
    async fn test_reminds_once_then_stops_at_zero() {
        let store = Arc::new(MemoryTaskStore::new());
        let adapter = ScriptedAdapter::new().with_rounds(vec![
            ScriptedRound::text(&["I'm done"]),
            ScriptedRound::tool("t1", "alpha__search"),
            ScriptedRound::text(&["finished everything"]),
        ]);
        let completer = Arc::clone(&store);
        let executor = RecordingExecutor::new().on_call(move |_| completer.complete_all());
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter.clone()))
            .executor(Arc::new(executor))
            .build()
            .unwrap();

        let mut controller = TaskEnforcementController::new(
            store.clone(),
            Arc::new(AskingDecider(ExistingTasks::Leave)),
        );
        controller.enable().await.unwrap();
        for title in ["write parser", "add tests", "update docs"] {
            store.add(title);
        }

        let outcome = controller
            .run_user_turn(&mut orch, "do the work", Vec::new())
            .await
            .unwrap();

        assert!(outcome.completed());
        let reminders: Vec<&Message> = orch
            .messages()
            .iter()
            .filter(|m| m.is_synthetic() && m.text().contains("incomplete task"))
            .collect();
        assert_eq!(reminders.len(), 1);
        assert!(reminders[0].text().contains("3 incomplete"));
        assert_eq!(adapter.round_trips(), 3);
        assert_eq!(adapter.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_briefing_sent_once_before_first_turn() {
        let store = Arc::new(MemoryTaskStore::new());
        let adapter = ScriptedAdapter::new()
            .with_rounds(vec![ScriptedRound::text(&["a"]), ScriptedRound::text(&["b"])]);
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(RecordingExecutor::new()))
            .build()
            .unwrap();
        let mut controller =
            TaskEnforcementController::new(store, Arc::new(AskingDecider(ExistingTasks::Clear)));
        controller.enable().await.unwrap();

        controller.run_user_turn(&mut orch, "one", Vec::new()).await.unwrap();
        controller.run_user_turn(&mut orch, "two", Vec::new()).await.unwrap();

        let briefings = orch
            .messages()
            .iter()
            .filter(|m| m.text().starts_with("Task enforcement is active"))
            .count();
        assert_eq!(briefings, 1);
        assert!(orch.messages()[0].is_synthetic());
        assert_eq!(orch.messages()[1].text(), "one");
    }

    #[tokio::test]
    async fn test_enable_resolves_existing_tasks() {
        let store = Arc::new(MemoryTaskStore::new());
        store.add("old task");

        let mut controller = TaskEnforcementController::new(
            store.clone(),
            Arc::new(AskingDecider(ExistingTasks::SkipAll)),
        );
        controller.enable().await.unwrap();
        assert!(store.outstanding().await.unwrap().is_empty());
        assert_eq!(store.skipped().await.unwrap().len(), 1);
        assert_eq!(controller.state().disposition, Some(ExistingTasks::SkipAll));

        let mut leave = TaskEnforcementController::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(AskingDecider(ExistingTasks::Leave)),
        );
        leave.enable().await.unwrap();
        assert_eq!(leave.state().disposition, None);
        assert!(leave.is_enabled());
    }

    #[tokio::test]
    async fn test_model_managed_tasks_drive_reminders() {
        let store = Arc::new(MemoryTaskStore::new());
        let adapter = ScriptedAdapter::new().with_rounds(vec![
            ScriptedRound::tool_with("c1", "tasks__add", serde_json::json!({"title": "write parser"})),
            ScriptedRound::text(&["I'm done"]),
            ScriptedRound::tool_with(
                "c2",
                "tasks__update",
                serde_json::json!({"id": "1", "status": "completed"}),
            ),
            ScriptedRound::text(&["parser written"]),
        ]);
        let inner = Arc::new(RecordingExecutor::new());
        let executor = TaskTools::new(store.clone(), inner.clone());
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter.clone()))
            .executor(Arc::new(executor))
            .build()
            .unwrap();
        let mut controller =
            TaskEnforcementController::new(store.clone(), Arc::new(AskingDecider(ExistingTasks::Clear)));
        controller.enable().await.unwrap();

        let outcome = controller
            .run_user_turn(&mut orch, "write the parser", Vec::new())
            .await
            .unwrap();

        assert!(outcome.completed());
        assert_eq!(adapter.round_trips(), 4);
        assert_eq!(adapter.requests().len(), 2);
        let tools: Vec<String> = adapter.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert!(tools.contains(&"tasks__add".to_string()));
        assert!(tools.contains(&"alpha__search".to_string()));

        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(inner.calls().is_empty());
        let reminders = orch
            .messages()
            .iter()
            .filter(|m| m.is_synthetic() && m.text().contains("1 incomplete task"))
            .count();
        assert_eq!(reminders, 1);
    }

    #[tokio::test]
    async fn test_task_tools_forward_and_validate() {
        let store = Arc::new(MemoryTaskStore::new());
        let inner = Arc::new(RecordingExecutor::new());
        let tools = TaskTools::new(store.clone(), inner.clone());

        let added = tools
            .execute("tasks__add", serde_json::json!({"titles": ["a", "b"]}))
            .await;
        assert_eq!(added.display_text, "Added:\n- [1] a\n- [2] b");
        assert!(tools.execute("tasks__add", serde_json::json!({})).await.is_error);
        assert!(
            tools
                .execute("tasks__update", serde_json::json!({"id": "9", "status": "completed"}))
                .await
                .is_error
        );
        assert!(
            tools
                .execute("tasks__update", serde_json::json!({"id": "1", "status": "done"}))
                .await
                .is_error
        );
        tools
            .execute("tasks__update", serde_json::json!({"id": "2", "status": "skipped"}))
            .await;
        assert_eq!(
            tools.execute("tasks__list", serde_json::json!({})).await.display_text,
            "[1] a (pending)\n[2] b (skipped)"
        );

        let forwarded = tools.execute("alpha__search", serde_json::json!({})).await;
        assert_eq!(forwarded.display_text, "alpha__search ok");
        assert_eq!(inner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_turn_keeps_briefing_pending() {
        let adapter = ScriptedAdapter::new().with_rounds(vec![ScriptedRound::text(&["ok"])]);
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(RecordingExecutor::new()))
            .build()
            .unwrap();
        let mut controller = TaskEnforcementController::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(AskingDecider(ExistingTasks::Clear)),
        );
        controller.enable().await.unwrap();

        let busy = orch.busy_flag();
        let guard = busy.try_acquire().unwrap();
        let err = controller.run_user_turn(&mut orch, "one", Vec::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Busy));
        assert!(orch.messages().is_empty());
        assert!(!controller.state().briefed);
        drop(guard);

        controller.run_user_turn(&mut orch, "one", Vec::new()).await.unwrap();
        assert!(controller.state().briefed);
        assert!(orch.messages()[0].text().starts_with("Task enforcement is active"));
        assert_eq!(orch.messages()[1].text(), "one");
    }

    #[test]
    fn test_reminder_lists_tasks() {
        let tasks = vec![TaskItem {
            id: "1".into(),
            title: "ship it".into(),
            status: TaskStatus::Pending,
        }];
        assert_eq!(
            reminder_text(&tasks),
            "You still have 1 incomplete task. Continue working until every task is complete:\n- [1] ship it"
        );
    }
}
