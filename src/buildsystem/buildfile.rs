//! The build-file model and manifest loader.
//!
//! A build manifest is a TOML document:
//!
//! ```toml
//! [client]
//! name = "basic"
//! version = 0
//!
//! [targets]
//! all = ["out"]
//!
//! [commands.c1]
//! tool = "shell"
//! inputs = ["in"]
//! outputs = ["out"]
//! args = ["cp", "in", "out"]
//! ```
//!
//! Nodes referenced by commands or targets but not declared under
//! `[nodes]` are minted implicitly; names wrapped in `<...>` are virtual.
//! Structural errors are collected through the delegate rather than
//! aborting the load; only an unreadable or unparseable file, or a client
//! name/version mismatch, fails it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::buildsystem::command::{Command, ConfigureContext, Tool};
use crate::buildsystem::system::{ManifestToken, SystemDelegate};
use crate::buildsystem::tools::lookup_builtin_tool;

/// A tool or command attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Scalar(String),
    List(Vec<String>),
    Map(Vec<(String, String)>),
}

/// A node: an input or a producible artifact (file or virtual).
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub name: String,
    /// Virtual nodes (`<name>`) track ordering without filesystem state.
    pub is_virtual: bool,
    pub attributes: BTreeMap<String, String>,
    /// Commands declaring this node as an output, in definition order.
    pub producers: Vec<usize>,
}

impl BuildNode {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let is_virtual = name.len() >= 2 && name.starts_with('<') && name.ends_with('>');
        BuildNode {
            name,
            is_virtual,
            attributes: BTreeMap::new(),
            producers: Vec::new(),
        }
    }
}

/// A named ordered list of nodes to build.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    pub name: String,
    pub nodes: Vec<usize>,
}

/// A loaded build description: the arenas of nodes, targets and commands,
/// plus the tools instantiated while loading, in registration order.
pub struct BuildFile {
    pub client_name: String,
    pub client_version: u32,
    pub client_properties: Vec<(String, String)>,
    nodes: Vec<BuildNode>,
    node_index: HashMap<String, usize>,
    targets: Vec<BuildTarget>,
    target_index: HashMap<String, usize>,
    commands: Vec<Arc<dyn Command>>,
    command_index: HashMap<String, usize>,
    tools: Vec<Box<dyn Tool>>,
}

impl BuildFile {
    /// Load and validate the manifest at `path`.
    pub fn load(path: &Path, delegate: &dyn SystemDelegate) -> Result<BuildFile> {
        Loader::new(path, delegate).load()
    }

    pub fn node(&self, index: usize) -> &BuildNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[BuildNode] {
        &self.nodes
    }

    pub fn node_named(&self, name: &str) -> Option<usize> {
        self.node_index.get(name).copied()
    }

    pub fn target_named(&self, name: &str) -> Option<&BuildTarget> {
        self.target_index.get(name).map(|&ix| &self.targets[ix])
    }

    pub fn targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    pub fn command(&self, index: usize) -> &Arc<dyn Command> {
        &self.commands[index]
    }

    pub fn command_named(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.command_index.get(name).map(|&ix| &self.commands[ix])
    }

    pub fn commands(&self) -> &[Arc<dyn Command>] {
        &self.commands
    }

    /// Tools in registration order (first lookup wins for custom tasks).
    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }
}

struct Loader<'a> {
    delegate: &'a dyn SystemDelegate,
    path: &'a Path,
    filename: String,
    nodes: Vec<BuildNode>,
    node_index: HashMap<String, usize>,
    targets: Vec<BuildTarget>,
    target_index: HashMap<String, usize>,
    commands: Vec<Arc<dyn Command>>,
    command_index: HashMap<String, usize>,
    tools: Vec<Box<dyn Tool>>,
    tool_index: HashMap<String, usize>,
}

impl<'a> Loader<'a> {
    fn new(path: &'a Path, delegate: &'a dyn SystemDelegate) -> Self {
        Loader {
            delegate,
            path,
            filename: path.display().to_string(),
            nodes: Vec::new(),
            node_index: HashMap::new(),
            targets: Vec::new(),
            target_index: HashMap::new(),
            commands: Vec::new(),
            command_index: HashMap::new(),
            tools: Vec::new(),
            tool_index: HashMap::new(),
        }
    }

    fn error(&self, at: Option<&ManifestToken>, message: impl AsRef<str>) {
        self.delegate.error(&self.filename, at, message.as_ref());
    }

    fn load(mut self) -> Result<BuildFile> {
        let Some(bytes) = self.delegate.file_system().get_file_contents(self.path) else {
            self.error(None, "unable to read build file");
            bail!("unable to read build file: {}", self.filename);
        };
        self.delegate.file_contents_being_parsed(&bytes);

        let Ok(text) = std::str::from_utf8(&bytes) else {
            self.error(None, "build file is not valid UTF-8");
            bail!("build file is not valid UTF-8: {}", self.filename);
        };

        let root: toml::Value = match toml::from_str(text) {
            Ok(root) => root,
            Err(error) => {
                let token = error.span().map(|span| ManifestToken {
                    offset: span.start,
                    length: span.len().max(1),
                });
                self.error(token.as_ref(), error.message());
                bail!("failed to parse build file: {}", self.filename);
            }
        };
        let Some(table) = root.as_table() else {
            self.error(None, "build file must be a table");
            bail!("build file must be a table: {}", self.filename);
        };

        let (client_name, client_version, client_properties) =
            self.parse_client(table.get("client"))?;

        if let Some(tools) = table.get("tools") {
            self.parse_tools(tools);
        }
        if let Some(targets) = table.get("targets") {
            self.parse_targets(targets);
        }
        if let Some(nodes) = table.get("nodes") {
            self.parse_nodes(nodes);
        }
        if let Some(commands) = table.get("commands") {
            self.parse_commands(commands);
        }

        for key in table.keys() {
            if !matches!(
                key.as_str(),
                "client" | "tools" | "targets" | "nodes" | "commands"
            ) {
                self.error(None, format!("unexpected top-level section '{key}'"));
            }
        }

        Ok(BuildFile {
            client_name,
            client_version,
            client_properties,
            nodes: self.nodes,
            node_index: self.node_index,
            targets: self.targets,
            target_index: self.target_index,
            commands: self.commands,
            command_index: self.command_index,
            tools: self.tools,
        })
    }

    fn parse_client(
        &mut self,
        value: Option<&toml::Value>,
    ) -> Result<(String, u32, Vec<(String, String)>)> {
        let Some(table) = value.and_then(|v| v.as_table()) else {
            self.error(None, "missing 'client' section");
            bail!("missing 'client' section: {}", self.filename);
        };

        let Some(name) = table.get("name").and_then(|v| v.as_str()) else {
            self.error(None, "missing client name");
            bail!("missing client name: {}", self.filename);
        };
        let version = table.get("version").and_then(|v| v.as_integer()).unwrap_or(0);
        if !(0..=i64::from(u16::MAX)).contains(&version) {
            self.error(None, format!("unsupported client version {version}"));
            bail!("unsupported client version: {}", self.filename);
        }
        let version = version as u32;

        // The client must match what the delegate was configured for.
        if name != self.delegate.name() {
            self.error(
                None,
                format!(
                    "build file is for client '{}', expected '{}'",
                    name,
                    self.delegate.name()
                ),
            );
            bail!("client name mismatch: {}", self.filename);
        }
        if version != self.delegate.version() {
            self.error(
                None,
                format!(
                    "build file client version {} does not match expected version {}",
                    version,
                    self.delegate.version()
                ),
            );
            bail!("client version mismatch: {}", self.filename);
        }

        let mut properties = Vec::new();
        for (key, value) in table {
            if key == "name" || key == "version" {
                continue;
            }
            match scalar_string(value) {
                Some(scalar) => properties.push((key.clone(), scalar)),
                None => self.error(None, format!("invalid value for client property '{key}'")),
            }
        }
        Ok((name.to_string(), version, properties))
    }

    fn parse_tools(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            self.error(None, "invalid 'tools' section");
            return;
        };
        for (name, attrs) in table {
            let Some(tool_ix) = self.ensure_tool(name) else {
                continue;
            };
            let Some(attrs) = attrs.as_table() else {
                self.error(None, format!("invalid definition for tool '{name}'"));
                continue;
            };
            for (key, value) in attrs {
                match attr_value(value) {
                    Some(attr) => {
                        // Split borrow: the context reads nodes, the tool
                        // is mutated.
                        let ctx = ConfigureContext {
                            delegate: self.delegate,
                            filename: &self.filename,
                            nodes: &self.nodes,
                        };
                        self.tools[tool_ix].configure_attribute(&ctx, key, &attr);
                    }
                    None => self.error(None, format!("invalid value for attribute '{key}'")),
                }
            }
        }
    }

    fn parse_targets(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            self.error(None, "invalid 'targets' section");
            return;
        };
        for (name, value) in table {
            let Some(items) = value.as_array() else {
                self.error(None, format!("invalid value for target '{name}'"));
                continue;
            };
            let mut nodes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(node_name) => nodes.push(self.node_for(node_name)),
                    None => self.error(None, format!("invalid node name in target '{name}'")),
                }
            }
            let index = self.targets.len();
            self.targets.push(BuildTarget {
                name: name.clone(),
                nodes,
            });
            self.target_index.insert(name.clone(), index);
        }
    }

    fn parse_nodes(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            self.error(None, "invalid 'nodes' section");
            return;
        };
        for (name, attrs) in table {
            let node_ix = self.node_for(name);
            let Some(attrs) = attrs.as_table() else {
                self.error(None, format!("invalid definition for node '{name}'"));
                continue;
            };
            for (key, value) in attrs {
                match scalar_string(value) {
                    Some(scalar) => {
                        self.nodes[node_ix].attributes.insert(key.clone(), scalar);
                    }
                    None => self.error(
                        None,
                        format!("invalid value for attribute '{key}' of node '{name}'"),
                    ),
                }
            }
        }
    }

    fn parse_commands(&mut self, value: &toml::Value) {
        let Some(table) = value.as_table() else {
            self.error(None, "invalid 'commands' section");
            return;
        };
        for (name, value) in table {
            let Some(attrs) = value.as_table() else {
                self.error(None, format!("invalid definition for command '{name}'"));
                continue;
            };
            let Some(tool_name) = attrs.get("tool").and_then(|v| v.as_str()) else {
                self.error(None, format!("missing 'tool' key for command '{name}'"));
                continue;
            };
            let Some(tool_ix) = self.ensure_tool(tool_name) else {
                continue;
            };

            let mut command = self.tools[tool_ix].create_command(name);
            for (key, value) in attrs {
                match key.as_str() {
                    "tool" => {}
                    "inputs" | "outputs" => {
                        let Some(items) = value.as_array() else {
                            self.error(
                                None,
                                format!("invalid value for '{key}' in command '{name}'"),
                            );
                            continue;
                        };
                        let mut node_ixs = Vec::with_capacity(items.len());
                        for item in items {
                            match item.as_str() {
                                Some(node_name) => node_ixs.push(self.node_for(node_name)),
                                None => self.error(
                                    None,
                                    format!("invalid node name in command '{name}'"),
                                ),
                            }
                        }
                        let ctx = ConfigureContext {
                            delegate: self.delegate,
                            filename: &self.filename,
                            nodes: &self.nodes,
                        };
                        if key == "inputs" {
                            command.configure_inputs(&ctx, node_ixs);
                        } else {
                            command.configure_outputs(&ctx, node_ixs);
                        }
                    }
                    "description" => match value.as_str() {
                        Some(description) => command.configure_description(description),
                        None => self.error(
                            None,
                            format!("invalid description for command '{name}'"),
                        ),
                    },
                    _ => match attr_value(value) {
                        Some(attr) => {
                            let ctx = ConfigureContext {
                                delegate: self.delegate,
                                filename: &self.filename,
                                nodes: &self.nodes,
                            };
                            command.configure_attribute(&ctx, key, &attr);
                        }
                        None => {
                            self.error(None, format!("invalid value for attribute '{key}'"))
                        }
                    },
                }
            }

            let command_ix = self.commands.len();
            for &output in command.outputs() {
                self.nodes[output].producers.push(command_ix);
            }
            self.commands.push(Arc::from(command));
            self.command_index.insert(name.clone(), command_ix);
        }
    }

    fn node_for(&mut self, name: &str) -> usize {
        if let Some(&ix) = self.node_index.get(name) {
            return ix;
        }
        let ix = self.nodes.len();
        self.nodes.push(BuildNode::new(name));
        self.node_index.insert(name.to_string(), ix);
        ix
    }

    fn ensure_tool(&mut self, name: &str) -> Option<usize> {
        if let Some(&ix) = self.tool_index.get(name) {
            return Some(ix);
        }
        // The client gets the first chance to provide the tool.
        let tool = self
            .delegate
            .lookup_tool(name)
            .or_else(|| lookup_builtin_tool(name));
        match tool {
            Some(tool) => {
                let ix = self.tools.len();
                self.tools.push(tool);
                self.tool_index.insert(name.to_string(), ix);
                Some(ix)
            }
            None => {
                self.error(None, format!("unknown tool: '{name}'"));
                None
            }
        }
    }
}

fn scalar_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        _ => None,
    }
}

fn attr_value(value: &toml::Value) -> Option<AttrValue> {
    match value {
        toml::Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(scalar_string(item)?);
            }
            Some(AttrValue::List(list))
        }
        toml::Value::Table(entries) => {
            let mut map = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                map.push((key.clone(), scalar_string(value)?));
            }
            Some(AttrValue::Map(map))
        }
        other => scalar_string(other).map(AttrValue::Scalar),
    }
}
