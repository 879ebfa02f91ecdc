use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use mht::ParameterKey;

/// A captured `#begin name ... #end name` body.
#[derive(Debug, Clone)]
pub struct Block {
    /// Raw, unexpanded lines, terminators included.
    pub lines: Vec<String>,
    /// File the block was captured from, for diagnostics.
    pub origin: Option<PathBuf>,
    /// Line number of the first body line in `origin`.
    pub first_line: usize,
}

/// The positional parameters of one active block invocation.
#[derive(Debug, Clone)]
struct ParameterFrame {
    block: String,
    /// Index 0 holds `.%1`. Empty parameters are never bound.
    parameters: Vec<Option<String>>,
}

/// The symbol stores: macros, blocks and the block-parameter bindings of
/// the invocations currently running.
#[derive(Debug, Default)]
pub struct Environment {
    macros: HashMap<String, String>,
    blocks: HashMap<String, Rc<Block>>,
    frames: Vec<ParameterFrame>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    pub fn define_macro(&mut self, name: &str, definition: &str) {
        self.macros.insert(name.to_string(), definition.to_string());
    }

    pub fn get_macro(&self, name: &str) -> Option<&str> {
        self.macros.get(name).map(String::as_str)
    }

    pub fn undef_macro(&mut self, name: &str) -> bool {
        self.macros.remove(name).is_some()
    }

    pub fn define_block(&mut self, name: &str, block: Block) {
        self.blocks.insert(name.to_string(), Rc::new(block));
    }

    /// Blocks are handed out by reference count so a block can redefine or
    /// remove itself while it is being replayed.
    pub fn get_block(&self, name: &str) -> Option<Rc<Block>> {
        self.blocks.get(name).cloned()
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    pub fn undef_block(&mut self, name: &str) -> bool {
        self.blocks.remove(name).is_some()
    }

    /// Sorted block names.
    pub fn block_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.blocks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn push_parameters(&mut self, block: &str, parameters: &[String]) {
        let parameters = parameters
            .iter()
            .map(|p| if p.is_empty() { None } else { Some(p.clone()) })
            .collect();
        self.frames.push(ParameterFrame {
            block: block.to_string(),
            parameters,
        });
    }

    pub fn pop_parameters(&mut self) {
        self.frames.pop();
    }

    /// Resolve `block.%n` against the innermost invocation of `block`, or
    /// `.%n` against the innermost invocation of any block.
    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        let key = ParameterKey::parse(name)?;
        let frame = self.find_frame(key)?;
        frame.parameters.get(key.index - 1)?.as_deref()
    }

    /// Unbind a parameter in the innermost matching invocation.
    pub fn undef_parameter(&mut self, name: &str) -> bool {
        let Some(key) = ParameterKey::parse(name) else {
            return false;
        };
        let frame = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| key.block.is_none_or(|block| frame.block == block));
        match frame.and_then(|f| f.parameters.get_mut(key.index - 1)) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Whether `name` resolves as a macro or as a bound block parameter.
    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name) || self.get_parameter(name).is_some()
    }

    fn find_frame(&self, key: ParameterKey<'_>) -> Option<&ParameterFrame> {
        self.frames
            .iter()
            .rev()
            .find(|frame| key.block.is_none_or(|block| frame.block == block))
    }
}
