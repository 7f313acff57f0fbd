use serde::Serialize;

/// Coarse class of a queueing discipline, as far as impairment is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DisciplineClass {
    /// Kernel default (noqueue, pfifo_fast, fq_codel, mq, ...).
    None,
    /// netem with a loss parameter.
    Loss,
    /// Token bucket rate limiting.
    Shaping,
    /// Anything else: netem without loss, htb, cake, ...
    Other,
}

impl DisciplineClass {
    pub fn is_impairment(self) -> bool {
        !matches!(self, DisciplineClass::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisciplineClass::None => "none",
            DisciplineClass::Loss => "loss",
            DisciplineClass::Shaping => "shaping",
            DisciplineClass::Other => "other",
        }
    }
}

const DEFAULT_QDISCS: &[&str] = &[
    "noqueue",
    "pfifo_fast",
    "fq_codel",
    "mq",
    "fq",
    "pfifo",
    "bfifo",
];

/// One line of `tc qdisc show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QdiscEntry {
    pub kind: String,
    pub handle: String,
    pub root: bool,
    pub class: DisciplineClass,
    /// Everything after the parent/refcnt prefix, e.g. `limit 1000 loss 1%`.
    pub params: String,
}

impl QdiscEntry {
    /// Parse `qdisc netem 8001: root refcnt 2 limit 1000 loss 1%`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "qdisc" {
            return None;
        }
        let kind = tokens.next()?.to_string();
        let handle = tokens.next()?.to_string();
        let rest: Vec<&str> = tokens.collect();
        let root = rest.first() == Some(&"root");

        // Skip "root" / "parent X:Y" / "dev X" / "refcnt N" to reach the parameters.
        let mut idx = 0;
        while idx < rest.len() {
            match rest[idx] {
                "root" => idx += 1,
                "parent" | "dev" | "refcnt" => idx += 2,
                _ => break,
            }
        }
        let params = rest.get(idx..).unwrap_or_default().join(" ");

        let class = match kind.as_str() {
            "netem" if params.split_whitespace().any(|t| t == "loss") => DisciplineClass::Loss,
            "tbf" => DisciplineClass::Shaping,
            k if DEFAULT_QDISCS.contains(&k) => DisciplineClass::None,
            _ => DisciplineClass::Other,
        };

        Some(Self {
            kind,
            handle,
            root,
            class,
            params,
        })
    }
}

/// What `verify` saw on an interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedState {
    pub interface: String,
    pub qdiscs: Vec<QdiscEntry>,
    /// Class of the last policy requested through this engine, if any.
    pub requested: Option<DisciplineClass>,
}

impl ObservedState {
    pub fn from_tc_output(
        interface: &str,
        stdout: &str,
        requested: Option<DisciplineClass>,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            qdiscs: stdout.lines().filter_map(QdiscEntry::parse).collect(),
            requested,
        }
    }

    /// Class of the root discipline. No root line means the kernel default.
    pub fn class(&self) -> DisciplineClass {
        self.qdiscs
            .iter()
            .find(|q| q.root)
            .map_or(DisciplineClass::None, |q| q.class)
    }

    /// More than one impairment discipline present anywhere on the interface.
    pub fn is_stacked(&self) -> bool {
        self.qdiscs.iter().filter(|q| q.class.is_impairment()).count() > 1
    }

    /// `None` when nothing was requested; otherwise whether the observed
    /// class equals the requested one with no stacking.
    pub fn matches(&self) -> Option<bool> {
        self.requested
            .map(|wanted| wanted == self.class() && !self.is_stacked())
    }

    pub fn summary(&self) -> String {
        let root = self
            .qdiscs
            .iter()
            .find(|q| q.root)
            .map_or_else(
                || "default".to_string(),
                |q| format!("{} {}", q.kind, q.params).trim().to_string(),
            );
        let verdict = match self.matches() {
            Some(true) => "matches request",
            Some(false) => "MISMATCH with request",
            None => "no request recorded",
        };
        format!(
            "{}: {} [{}] ({})",
            self.interface,
            self.class().as_str(),
            root,
            verdict
        )
    }
}
