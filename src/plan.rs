//! Execution plans: the structured todo list that drives a planner.
//!
//! Every handler reads the plan, produces a new plan, and writes it back
//! atomically through the artefact store. The markdown rendering is
//! derived, never edited in place.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One unit of the plan; becomes a worker task when selected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TodoItem {
    /// Original task description. New tasks added during revision carry a
    /// "(new)" marker in this field.
    pub description: String,

    /// Updated description if changed during a revision; folded back into
    /// `description` at merge time.
    #[serde(default)]
    pub updated_description: String,

    /// Leave false in LLM output; selection is applied separately.
    #[serde(default)]
    pub next_action: bool,

    #[serde(default)]
    pub completed: bool,

    /// Marked when a todo is no longer relevant.
    #[serde(default)]
    pub obsolete: bool,
}

impl TodoItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// A todo that is neither completed nor obsolete.
    pub fn is_open(&self) -> bool {
        !self.completed && !self.obsolete
    }

    fn display_description(&self) -> &str {
        if self.updated_description.trim().is_empty() {
            &self.description
        } else {
            self.updated_description.trim()
        }
    }
}

/// First-pass plan shape returned by the LLM: objective plus a flat list
/// of task descriptions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InitialExecutionPlan {
    /// Overall goal description.
    pub objective: String,

    /// Simple list of task descriptions, in execution order.
    pub todos: Vec<String>,
}

/// The structured execution plan persisted per planner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Overall objective of the execution plan.
    pub objective: String,

    /// List of todo items. The set only grows during a plan's life;
    /// revisions update descriptions or flip status flags.
    pub todos: Vec<TodoItem>,
}

impl ExecutionPlan {
    /// Promote an initial plan: the first todo becomes the next action.
    pub fn from_initial(initial: InitialExecutionPlan) -> Self {
        let todos = initial
            .todos
            .into_iter()
            .enumerate()
            .map(|(index, description)| TodoItem {
                next_action: index == 0,
                ..TodoItem::new(description)
            })
            .collect();

        Self {
            objective: initial.objective,
            todos,
        }
    }

    /// The todo currently marked for execution.
    pub fn next_action_todo(&self) -> Option<&TodoItem> {
        self.todos.iter().find(|todo| todo.next_action)
    }

    pub fn has_open_todos(&self) -> bool {
        self.todos.iter().any(TodoItem::is_open)
    }

    /// Open todos in plan order.
    pub fn open_todos(&self) -> Vec<TodoItem> {
        self.todos
            .iter()
            .filter(|todo| todo.is_open())
            .cloned()
            .collect()
    }

    /// A copy containing only the open todos, for LLM revision prompts.
    /// The model never sees completed or obsolete entries.
    pub fn open_view(&self) -> ExecutionPlan {
        ExecutionPlan {
            objective: self.objective.clone(),
            todos: self.open_todos(),
        }
    }

    /// Mark the current next-action todo as completed.
    pub fn complete_next_action(&mut self) {
        for todo in &mut self.todos {
            if todo.next_action {
                todo.completed = true;
                todo.next_action = false;
                break;
            }
        }
    }

    /// Merge an LLM revision of the open todos back into this plan.
    ///
    /// Completed and obsolete todos are preserved verbatim; revised open
    /// todos replace the previous open set, with `updated_description`
    /// folded into `description`. Next-action selection is reapplied so
    /// at most one todo carries the flag.
    pub fn merge_revision(&self, revised: ExecutionPlan) -> ExecutionPlan {
        let mut todos: Vec<TodoItem> = self
            .todos
            .iter()
            .filter(|todo| todo.completed || todo.obsolete)
            .cloned()
            .collect();

        for mut todo in revised.todos {
            if !todo.updated_description.trim().is_empty() {
                todo.description = todo.updated_description.trim().to_string();
                todo.updated_description = String::new();
            }
            // A revision cannot resurrect a contradictory state.
            if todo.completed && todo.obsolete {
                todo.obsolete = false;
            }
            todos.push(todo);
        }

        let objective = if revised.objective.trim().is_empty() {
            self.objective.clone()
        } else {
            revised.objective
        };

        let mut merged = ExecutionPlan { objective, todos };
        merged.apply_next_action();
        merged
    }

    /// Clear all next-action flags and set the first open todo, if any.
    pub fn apply_next_action(&mut self) {
        for todo in &mut self.todos {
            todo.next_action = false;
        }
        if let Some(todo) = self.todos.iter_mut().find(|todo| todo.is_open()) {
            todo.next_action = true;
        }
    }

    /// Markdown rendering with checkbox icons.
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Objective".to_string(),
            self.objective.clone(),
            String::new(),
            "# Todos".to_string(),
        ];

        for todo in &self.todos {
            let description = todo.display_description();
            if todo.completed {
                lines.push(format!("- [x] ~~{description}~~"));
            } else if todo.obsolete {
                lines.push(format!("- [-] ~~{description}~~"));
            } else {
                lines.push(format!("- [ ] {description}"));
            }
        }

        lines.join("\n")
    }
}

/// Extract the open todo descriptions from a markdown rendering.
///
/// Inverse of `to_markdown` for the open entries only; completed and
/// obsolete lines are skipped.
pub fn open_todos_from_markdown(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- [ ] "))
        .map(|description| description.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(descriptions: &[&str]) -> ExecutionPlan {
        ExecutionPlan::from_initial(InitialExecutionPlan {
            objective: "Answer the revenue question".to_string(),
            todos: descriptions.iter().map(|d| d.to_string()).collect(),
        })
    }

    #[test]
    fn initial_plan_marks_first_todo_as_next_action() {
        let plan = plan_with(&["load the csv", "sum the revenue"]);
        assert_eq!(plan.todos.len(), 2);
        assert!(plan.todos[0].next_action);
        assert!(!plan.todos[1].next_action);
        assert_eq!(
            plan.next_action_todo().map(|todo| todo.description.as_str()),
            Some("load the csv")
        );
    }

    #[test]
    fn at_most_one_next_action_after_merge() {
        let plan = plan_with(&["a", "b", "c"]);
        let revision = ExecutionPlan {
            objective: String::new(),
            todos: vec![
                TodoItem::new("a"),
                TodoItem::new("b"),
                TodoItem::new("(new) d"),
            ],
        };

        let merged = plan.merge_revision(revision);
        let flagged = merged.todos.iter().filter(|todo| todo.next_action).count();
        assert_eq!(flagged, 1);
        assert_eq!(merged.objective, "Answer the revenue question");
    }

    #[test]
    fn merge_preserves_completed_todos_and_folds_updates() {
        let mut plan = plan_with(&["a", "b"]);
        plan.complete_next_action();

        let revision = ExecutionPlan {
            objective: "Answer the revenue question".to_string(),
            todos: vec![TodoItem {
                description: "b".to_string(),
                updated_description: "b, but sharper".to_string(),
                ..Default::default()
            }],
        };

        let merged = plan.merge_revision(revision);
        assert_eq!(merged.todos.len(), 2);
        assert!(merged.todos[0].completed);
        assert_eq!(merged.todos[1].description, "b, but sharper");
        assert!(merged.todos[1].updated_description.is_empty());
        assert!(merged.todos[1].next_action);
    }

    #[test]
    fn completing_every_todo_leaves_no_next_action() {
        let mut plan = plan_with(&["only step"]);
        plan.complete_next_action();
        plan.apply_next_action();

        assert!(!plan.has_open_todos());
        assert!(plan.next_action_todo().is_none());
    }

    #[test]
    fn no_todo_is_ever_completed_and_obsolete() {
        let plan = plan_with(&["a"]);
        let revision = ExecutionPlan {
            objective: String::new(),
            todos: vec![TodoItem {
                description: "a".to_string(),
                completed: true,
                obsolete: true,
                ..Default::default()
            }],
        };

        let merged = plan.merge_revision(revision);
        for todo in &merged.todos {
            assert!(!(todo.completed && todo.obsolete));
        }
    }

    #[test]
    fn markdown_round_trips_open_todos() {
        let mut plan = plan_with(&["first", "second", "third"]);
        plan.complete_next_action();
        plan.todos[2].obsolete = true;
        plan.apply_next_action();

        let markdown = plan.to_markdown();
        assert!(markdown.contains("- [x] ~~first~~"));

        let open = open_todos_from_markdown(&markdown);
        let expected: Vec<String> = plan
            .open_todos()
            .iter()
            .map(|todo| todo.description.clone())
            .collect();
        assert_eq!(open, expected);
        assert_eq!(open, vec!["second".to_string()]);
    }
}
