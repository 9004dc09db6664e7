//! Load-time compilation of a [`FunctionFile`] into a [`ScalarFunction`].
//!
//! Everything that can be decided without an input is decided here: profile
//! shape, expression syntax, field and index bounds, which tasks an
//! expression may read, and the wave schedule. A compiled function is
//! immutable and evaluated against many inputs.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use super::spec::{FunctionFile, TaskDef, TaskKind};
use crate::backend::Role;
use crate::error::{ConfigError, ConfigResult};
use crate::expr::{CompiledExpr, ExprError, Shape, ShapeEnv, TaskSlot};
use crate::profile::EnsembleProfile;
use crate::schema::InputSchema;

/// A message whose content is rendered per invocation.
#[derive(Debug, Clone)]
pub struct CompiledMessage {
    pub role: Role,
    pub content: CompiledExpr,
}

#[derive(Debug, Clone)]
pub struct CompiledTask {
    pub index: usize,
    pub kind: TaskKind,
    pub messages: Vec<CompiledMessage>,
    pub skip: Option<CompiledExpr>,
    pub map: Option<CompiledExpr>,
    pub responses: Vec<String>,
    pub profile: EnsembleProfile,
    /// Leading tasks this task waits for and sees as `tasks`.
    pub upstream: usize,
}

impl CompiledTask {
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Shape of this task's entry in the `tasks` array.
    pub fn output_shape(&self) -> Shape {
        let single = Shape::task_output(self.responses.len());
        if self.is_mapped() {
            Shape::array(single, None)
        } else {
            single
        }
    }

    fn expressions(&self) -> impl Iterator<Item = &CompiledExpr> {
        self.messages
            .iter()
            .map(|m| &m.content)
            .chain(self.skip.as_ref())
            .chain(self.map.as_ref())
    }
}

/// A validated function definition bound to its ensemble profiles.
#[derive(Debug, Clone)]
pub struct ScalarFunction {
    pub name: String,
    pub description: Option<String>,
    pub schema: InputSchema,
    pub tasks: Vec<CompiledTask>,
    pub output: CompiledExpr,
    /// Task indices grouped by dependency depth; tasks in a wave are independent.
    pub waves: Vec<Vec<usize>>,
    /// blake3 of the canonical JSON form of the source definition.
    pub fingerprint: String,
}

impl ScalarFunction {
    pub fn compile(file: FunctionFile) -> ConfigResult<Self> {
        let FunctionFile { function, profile } = &file;
        if function.tasks.is_empty() {
            return Err(ConfigError::NoTasks);
        }
        if function.tasks.len() != profile.tasks.len() {
            return Err(ConfigError::ProfileCountMismatch {
                tasks: function.tasks.len(),
                profiles: profile.tasks.len(),
            });
        }

        let schema = InputSchema::new(function.input_schema.clone())?;
        let input_shape = schema.shape();

        let mut tasks = Vec::with_capacity(function.tasks.len());
        for (index, def) in function.tasks.iter().enumerate() {
            let ensemble = EnsembleProfile::from_def(index, &profile.tasks[index])?;
            tasks.push(compile_task(index, def, ensemble)?);
        }

        // Second pass: every task's shape is known, check expressions.
        let skippable: Vec<bool> = tasks.iter().map(|t| t.skip.is_some()).collect();
        for task in &tasks {
            let env = ShapeEnv::new(input_shape.clone())
                .with_tasks(visible_tasks(&tasks, &skippable, task.index));
            check_task(task, &env)?;
        }

        let output = parse_expr("output", &function.output)?;
        let output_env =
            ShapeEnv::new(input_shape).with_tasks(visible_tasks(&tasks, &skippable, tasks.len()));
        output.check(&output_env).map_err(|source| ConfigError::Expression {
            location: "output".to_string(),
            source,
        })?;

        let waves = schedule(&tasks)?;
        let fingerprint = fingerprint(&file)?;

        debug!(
            function = %function.name,
            tasks = tasks.len(),
            waves = waves.len(),
            fingerprint = %fingerprint,
            "compiled function"
        );

        Ok(Self {
            name: function.name.clone(),
            description: function.description.clone(),
            schema,
            tasks,
            output,
            waves,
            fingerprint,
        })
    }
}

fn parse_expr(location: &str, source: &str) -> ConfigResult<CompiledExpr> {
    CompiledExpr::parse(source).map_err(|source| ConfigError::Expression {
        location: location.to_string(),
        source,
    })
}

fn compile_task(
    index: usize,
    def: &TaskDef,
    profile: EnsembleProfile,
) -> ConfigResult<CompiledTask> {
    if def.responses.is_empty() {
        return Err(ConfigError::EmptyResponses { task: index });
    }
    if def.messages.is_empty() {
        return Err(ConfigError::NoMessages { task: index });
    }

    let messages = def
        .messages
        .iter()
        .enumerate()
        .map(|(m, msg)| {
            Ok(CompiledMessage {
                role: msg.role,
                content: parse_expr(&format!("task {index} message {m}"), &msg.content)?,
            })
        })
        .collect::<ConfigResult<Vec<_>>>()?;
    let skip = def
        .skip
        .as_deref()
        .map(|src| parse_expr(&format!("task {index} skip"), src))
        .transpose()?;
    let map = def
        .map
        .as_deref()
        .map(|src| parse_expr(&format!("task {index} map"), src))
        .transpose()?;

    let mut task = CompiledTask {
        index,
        kind: def.kind,
        messages,
        skip,
        map,
        responses: def.responses.clone(),
        profile,
        upstream: 0,
    };
    task.upstream = upstream_of(&task);
    Ok(task)
}

/// How many leading tasks `task` depends on.
///
/// Reading `tasks[i]` depends on every task up to `i`, since positions in
/// the array shift if an earlier task is missing. Reading the bare array
/// depends on everything before the task.
fn upstream_of(task: &CompiledTask) -> usize {
    if task.expressions().any(|e| e.expr().reads_all_tasks()) {
        return task.index;
    }
    task.expressions()
        .flat_map(|e| e.expr().task_references())
        .max()
        .map_or(0, |i| i + 1)
}

/// Which `tasks[i]` an expression owned by `owner` may read.
fn visible_tasks(tasks: &[CompiledTask], skippable: &[bool], owner: usize) -> Vec<TaskSlot> {
    let first_skippable = skippable.iter().position(|&s| s);
    tasks
        .iter()
        .map(|task| {
            if task.index >= owner {
                TaskSlot::Unavailable(format!("task {} has not run yet", task.index))
            } else if let Some(k) = first_skippable.filter(|&k| k <= task.index) {
                TaskSlot::Unavailable(format!("task {k} may be skipped, shifting positions"))
            } else {
                TaskSlot::Available(task.output_shape())
            }
        })
        .collect()
}

fn check_task(task: &CompiledTask, env: &ShapeEnv) -> ConfigResult<()> {
    let i = task.index;
    let located =
        |location: String| move |source: ExprError| ConfigError::Expression { location, source };

    if let Some(skip) = &task.skip {
        let shape = skip.check(env).map_err(located(format!("task {i} skip")))?;
        expect_shape(&shape, matches!(shape, Shape::Any | Shape::Bool), "skip", "boolean")
            .map_err(located(format!("task {i} skip")))?;
    }

    let item_env = match &task.map {
        Some(map) => {
            let shape = map.check(env).map_err(located(format!("task {i} map")))?;
            expect_shape(
                &shape,
                matches!(shape, Shape::Any | Shape::Array { .. } | Shape::Tuple(_)),
                "map",
                "array",
            )
            .map_err(located(format!("task {i} map")))?;
            env.clone().with_item(shape.element())
        }
        None => env.clone(),
    };

    for (m, message) in task.messages.iter().enumerate() {
        let location = format!("task {i} message {m}");
        let shape = message
            .content
            .check(&item_env)
            .map_err(located(location.clone()))?;
        expect_shape(
            &shape,
            matches!(shape, Shape::Any | Shape::String),
            "message content",
            "string",
        )
        .map_err(located(location))?;
    }
    Ok(())
}

fn expect_shape(
    shape: &Shape,
    ok: bool,
    operation: &str,
    expected: &'static str,
) -> Result<(), ExprError> {
    if ok {
        Ok(())
    } else {
        Err(ExprError::TypeMismatch {
            operation: operation.to_string(),
            expected,
            found: shape.name(),
        })
    }
}

/// Group tasks into waves by dependency depth.
fn schedule(tasks: &[CompiledTask]) -> ConfigResult<Vec<Vec<usize>>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = tasks.iter().map(|t| graph.add_node(t.index)).collect();
    for task in tasks {
        for dep in 0..task.upstream {
            graph.add_edge(nodes[dep], nodes[task.index], ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        ConfigError::Engine(format!(
            "task dependency cycle through task {}",
            graph[cycle.node_id()]
        ))
    })?;

    let mut depth = vec![0usize; tasks.len()];
    for node in order {
        let i = graph[node];
        depth[i] = graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|dep| depth[graph[dep]] + 1)
            .max()
            .unwrap_or(0);
    }

    let levels = depth.iter().copied().max().unwrap_or(0) + 1;
    let mut waves = vec![Vec::new(); levels];
    for (i, d) in depth.into_iter().enumerate() {
        waves[d].push(i);
    }
    Ok(waves)
}

fn fingerprint(file: &FunctionFile) -> ConfigResult<String> {
    let canonical = serde_json::to_vec(file).map_err(|e| ConfigError::Parse {
        format: "json",
        message: e.to_string(),
    })?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}
