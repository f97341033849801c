// used for persistence
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

// used to keep the one-to-one mapping between paths and their node identities
use bimap::BiMap;

// node sets are walked with bitmaps when looking for cycles
use roaring::RoaringTreemap;

// our own stuff that we need
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;

// ------------- Node -------------
pub type NodeId = u64;

/// Interned paths. Every file the graph mentions, target or dependency,
/// is a node.
#[derive(Debug, Default)]
pub struct NodeKeeper {
    kept: BiMap<String, NodeId>,
}

impl NodeKeeper {
    pub fn new() -> Self {
        Self { kept: BiMap::new() }
    }
    pub fn keep(&mut self, path: &str, node: NodeId) {
        self.kept.insert(path.to_string(), node);
    }
    pub fn node(&self, path: &str) -> Option<NodeId> {
        self.kept.get_by_left(path).copied()
    }
    pub fn path(&self, node: NodeId) -> Option<&str> {
        self.kept.get_by_right(&node).map(String::as_str)
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

// ------------- Records -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    Static,
    Discovered,
    Explicit,
}

impl DepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Discovered => "discovered",
            Self::Explicit => "explicit",
        }
    }
}

impl FromStr for DepKind {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static" => Ok(Self::Static),
            "discovered" => Ok(Self::Discovered),
            "explicit" => Ok(Self::Explicit),
            other => Err(EngineError::Persistence(format!("bad dependency kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepRecord {
    /// Relative to the root, or absolute for explicit dependencies outside it.
    pub path: String,
    pub kind: DepKind,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Done,
    Steady,
    Error,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Done => "done",
            Self::Steady => "steady",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RecordState {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "done" => Ok(Self::Done),
            "steady" => Ok(Self::Steady),
            "error" => Ok(Self::Error),
            other => Err(EngineError::Persistence(format!("bad job state '{}'", other))),
        }
    }
}

/// What the last execution of a job left behind.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: String,
    pub rule: String,
    pub rule_fingerprint: String,
    pub state: RecordState,
    pub reason: Option<String>,
    pub targets: Vec<(String, Fingerprint)>,
    pub deps: Vec<DepRecord>,
    pub ended: DateTime<Utc>,
}

// ------------- Graph -------------
pub enum PersistenceMode {
    InMemory,
    File(PathBuf),
}

pub struct DependencyGraph {
    connection: Mutex<Connection>,
    node_keeper: Arc<Mutex<NodeKeeper>>,
}

impl DependencyGraph {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => {
                info!(path = %path.display(), "Opening dependency graph");
                Connection::open(path)?
            }
        };
        connection.execute_batch(
            "
            create table if not exists Node (
                Node_Identity integer not null,
                Path text not null,
                constraint referenceable_Node_Identity primary key (
                    Node_Identity
                ),
                constraint unique_Path unique (
                    Path
                )
            );
            create table if not exists Job (
                Job_Identity integer not null,
                Job text not null,
                Rule text not null,
                RuleFingerprint text not null,
                State text not null,
                Reason text null,
                Ended text not null,
                constraint referenceable_Job_Identity primary key (
                    Job_Identity
                ),
                constraint unique_Job unique (
                    Job
                )
            );
            create table if not exists JobTarget (
                Job_Identity integer not null,
                Node_Identity integer not null,
                Fingerprint text not null,
                constraint JobTarget_of_Job foreign key (
                    Job_Identity
                ) references Job(Job_Identity),
                constraint JobTarget_is_Node foreign key (
                    Node_Identity
                ) references Node(Node_Identity),
                constraint one_producer_per_Node primary key (
                    Node_Identity
                )
            );
            create table if not exists JobDep (
                Job_Identity integer not null,
                Position integer not null,
                Node_Identity integer not null,
                Kind text not null,
                Fingerprint text not null,
                constraint JobDep_of_Job foreign key (
                    Job_Identity
                ) references Job(Job_Identity),
                constraint JobDep_is_Node foreign key (
                    Node_Identity
                ) references Node(Node_Identity),
                constraint referenceable_JobDep primary key (
                    Job_Identity,
                    Position
                )
            );
            create index if not exists JobTarget_by_Job on JobTarget (Job_Identity);
            create index if not exists JobDep_by_Node on JobDep (Node_Identity);
            ",
        )?;
        // restore the interned paths
        let mut node_keeper = NodeKeeper::new();
        {
            let mut statement = connection.prepare("select Node_Identity, Path from Node")?;
            let rows = statement.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (node, path) = row?;
                node_keeper.keep(&path, node as NodeId);
            }
        }
        debug!(nodes = node_keeper.len(), "Dependency graph restored");
        Ok(Self {
            connection: Mutex::new(connection),
            node_keeper: Arc::new(Mutex::new(node_keeper)),
        })
    }
    pub fn node_keeper(&self) -> Arc<Mutex<NodeKeeper>> {
        Arc::clone(&self.node_keeper)
    }
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| EngineError::Invariant(format!("graph connection poisoned: {}", e)))
    }
    fn keeper(&self) -> Result<MutexGuard<'_, NodeKeeper>> {
        self.node_keeper
            .lock()
            .map_err(|e| EngineError::Invariant(format!("node keeper poisoned: {}", e)))
    }

    /// The last committed record of a job.
    pub fn job(&self, job: &str) -> Result<Option<JobRecord>> {
        let connection = self.lock()?;
        read_job(&connection, job)
    }
    /// Name of the job whose last execution produced `path`.
    pub fn producer(&self, path: &str) -> Result<Option<String>> {
        let connection = self.lock()?;
        let producer = connection
            .prepare_cached(
                "
                select j.Job
                    from JobTarget t
                    join Node n
                    on n.Node_Identity = t.Node_Identity
                    join Job j
                    on j.Job_Identity = t.Job_Identity
                    where n.Path = ?
            ",
            )?
            .query_row(params![path], |row| row.get(0))
            .optional()?;
        Ok(producer)
    }
    /// Whether some job depends on `path`.
    pub fn is_dependency(&self, path: &str) -> Result<bool> {
        let connection = self.lock()?;
        let found: Option<i64> = connection
            .prepare_cached(
                "
                select d.Job_Identity
                    from JobDep d
                    join Node n
                    on n.Node_Identity = d.Node_Identity
                    where n.Path = ?
                    limit 1
            ",
            )?
            .query_row(params![path], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }
    pub fn jobs(&self) -> Result<Vec<String>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare_cached("select Job from Job order by Job")?;
        let jobs = statement
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(jobs)
    }

    /// Replace the record of a job. Fails with a cycle error, leaving the
    /// graph untouched, when one of the dependencies is (transitively)
    /// produced from one of the targets.
    pub fn commit(&self, record: &JobRecord) -> Result<()> {
        let mut connection = self.lock()?;
        let deps: Vec<&str> = record.deps.iter().map(|d| d.path.as_str()).collect();
        let targets: Vec<&str> = record.targets.iter().map(|(t, _)| t.as_str()).collect();
        let mut keeper = self.keeper()?;
        if let Some(path) = find_cycle(&connection, &keeper, &record.job, &targets, &deps)? {
            return Err(EngineError::Cycle { target: record.job.clone(), path });
        }
        let tx = connection.transaction()?;
        let mut interned = Vec::new();
        let job = upsert_job(&tx, record)?;
        tx.execute("delete from JobTarget where Job_Identity = ?", params![job])?;
        tx.execute("delete from JobDep where Job_Identity = ?", params![job])?;
        for (target, fingerprint) in &record.targets {
            let node = intern(&tx, &keeper, target, &mut interned)?;
            // a target changing hands leaves its previous producer
            tx.execute("delete from JobTarget where Node_Identity = ?", params![node])?;
            tx.execute(
                "
                insert into JobTarget (
                    Job_Identity,
                    Node_Identity,
                    Fingerprint
                ) values (?, ?, ?)
            ",
                params![job, node, fingerprint.to_string()],
            )?;
        }
        for (position, dep) in record.deps.iter().enumerate() {
            let node = intern(&tx, &keeper, &dep.path, &mut interned)?;
            tx.execute(
                "
                insert into JobDep (
                    Job_Identity,
                    Position,
                    Node_Identity,
                    Kind,
                    Fingerprint
                ) values (?, ?, ?, ?, ?)
            ",
                params![job, position as i64, node, dep.kind.as_str(), dep.fingerprint.to_string()],
            )?;
        }
        tx.commit()?;
        for (path, node) in interned {
            keeper.keep(&path, node);
        }
        debug!(job = %record.job, state = %record.state, deps = record.deps.len(), "Job record committed");
        Ok(())
    }

    /// Record a failed or cancelled execution. The dependency list is
    /// cleared together with the state change, so that no partial list
    /// survives.
    pub fn mark_error(&self, job: &str, rule: &str, rule_fingerprint: &str, targets: &[String], reason: &str) -> Result<()> {
        let mut connection = self.lock()?;
        let mut keeper = self.keeper()?;
        let tx = connection.transaction()?;
        let mut interned = Vec::new();
        let record = JobRecord {
            job: job.to_string(),
            rule: rule.to_string(),
            rule_fingerprint: rule_fingerprint.to_string(),
            state: RecordState::Error,
            reason: Some(reason.to_string()),
            targets: Vec::new(),
            deps: Vec::new(),
            ended: Utc::now(),
        };
        let id = upsert_job(&tx, &record)?;
        tx.execute("delete from JobDep where Job_Identity = ?", params![id])?;
        tx.execute("delete from JobTarget where Job_Identity = ?", params![id])?;
        for target in targets {
            let node = intern(&tx, &keeper, target, &mut interned)?;
            tx.execute("delete from JobTarget where Node_Identity = ?", params![node])?;
            tx.execute(
                "insert into JobTarget (Job_Identity, Node_Identity, Fingerprint) values (?, ?, ?)",
                params![id, node, Fingerprint::None.to_string()],
            )?;
        }
        tx.commit()?;
        for (path, node) in interned {
            keeper.keep(&path, node);
        }
        info!(job, reason, "Job marked in error");
        Ok(())
    }
}

fn upsert_job(tx: &Transaction, record: &JobRecord) -> Result<i64> {
    tx.execute(
        "
        insert into Job (
            Job,
            Rule,
            RuleFingerprint,
            State,
            Reason,
            Ended
        ) values (?1, ?2, ?3, ?4, ?5, ?6)
        on conflict (Job) do update set
            Rule = ?2,
            RuleFingerprint = ?3,
            State = ?4,
            Reason = ?5,
            Ended = ?6
    ",
        params![
            record.job,
            record.rule,
            record.rule_fingerprint,
            record.state.to_string(),
            record.reason,
            record.ended
        ],
    )?;
    let id = tx.query_row("select Job_Identity from Job where Job = ?", params![record.job], |row| row.get(0))?;
    Ok(id)
}

// node for a path, created inside the transaction when new; the keeper
// only learns about it once the transaction commits
fn intern(tx: &Transaction, keeper: &NodeKeeper, path: &str, interned: &mut Vec<(String, NodeId)>) -> Result<i64> {
    if let Some(node) = keeper.node(path) {
        return Ok(node as i64);
    }
    tx.execute("insert or ignore into Node (Path) values (?)", params![path])?;
    let node: i64 = tx.query_row("select Node_Identity from Node where Path = ?", params![path], |row| row.get(0))?;
    interned.push((path.to_string(), node as NodeId));
    Ok(node)
}

fn read_job(connection: &Connection, job: &str) -> Result<Option<JobRecord>> {
    let head = connection
        .prepare_cached(
            "
            select Job_Identity, Rule, RuleFingerprint, State, Reason, Ended
                from Job
                where Job = ?
        ",
        )?
        .query_row(params![job], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, DateTime<Utc>>(5)?,
            ))
        })
        .optional()?;
    let Some((id, rule, rule_fingerprint, state, reason, ended)) = head else {
        return Ok(None);
    };
    let mut targets = Vec::new();
    {
        let mut statement = connection.prepare_cached(
            "
            select n.Path, t.Fingerprint
                from JobTarget t
                join Node n
                on n.Node_Identity = t.Node_Identity
                where t.Job_Identity = ?
                order by n.Path
        ",
        )?;
        let rows = statement.query_map(params![id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (path, fingerprint) = row?;
            targets.push((path, fingerprint.parse()?));
        }
    }
    let mut deps = Vec::new();
    {
        let mut statement = connection.prepare_cached(
            "
            select n.Path, d.Kind, d.Fingerprint
                from JobDep d
                join Node n
                on n.Node_Identity = d.Node_Identity
                where d.Job_Identity = ?
                order by d.Position
        ",
        )?;
        let rows = statement.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (path, kind, fingerprint) = row?;
            deps.push(DepRecord { path, kind: kind.parse()?, fingerprint: fingerprint.parse()? });
        }
    }
    Ok(Some(JobRecord {
        job: job.to_string(),
        rule,
        rule_fingerprint,
        state: state.parse()?,
        reason,
        targets,
        deps,
        ended,
    }))
}

// Walks from the dependencies through the jobs producing them. Reaching one
// of the targets closes a cycle; the returned path starts at that target.
fn find_cycle(
    connection: &Connection,
    keeper: &NodeKeeper,
    job: &str,
    targets: &[&str],
    deps: &[&str],
) -> Result<Option<Vec<String>>> {
    let target_nodes: HashSet<NodeId> = targets.iter().filter_map(|t| keeper.node(t)).collect();
    for dep in deps {
        if targets.contains(dep) {
            return Ok(Some(vec![dep.to_string(), dep.to_string()]));
        }
    }
    if target_nodes.is_empty() {
        return Ok(None);
    }
    let mut statement = connection.prepare_cached(
        "
        select d.Node_Identity
            from JobTarget t
            join JobDep d
            on d.Job_Identity = t.Job_Identity
            join Job j
            on j.Job_Identity = t.Job_Identity
            where t.Node_Identity = ?
            and j.Job <> ?
    ",
    )?;
    let mut visited = RoaringTreemap::new();
    let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
    let mut queue: VecDeque<NodeId> = deps.iter().filter_map(|d| keeper.node(d)).collect();
    for node in &queue {
        visited.insert(*node);
    }
    while let Some(node) = queue.pop_front() {
        if target_nodes.contains(&node) {
            let mut path = vec![node];
            let mut current = node;
            while let Some(previous) = parent.get(&current) {
                path.push(*previous);
                current = *previous;
            }
            // target, dependency of the job, ..., back to the target
            path.push(node);
            path.reverse();
            let names = path
                .iter()
                .map(|n| keeper.path(*n).unwrap_or("?").to_string())
                .collect();
            return Ok(Some(names));
        }
        let next = statement
            .query_map(params![node as i64, job], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        for successor in next {
            let successor = successor as NodeId;
            if visited.insert(successor) {
                parent.insert(successor, node);
                queue.push_back(successor);
            }
        }
    }
    Ok(None)
}
