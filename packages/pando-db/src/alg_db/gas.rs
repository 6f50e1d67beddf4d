//! Gather-apply-scatter adapter.
//!
//! A [`GasProgram`] supplies the three GAS functions plus init/output hooks;
//! [`GasVertex`] turns it into a [`VertexProgram`] with the usual template:
//!
//! - iteration 0: take the init value, stay ACTIVE
//! - iteration i > 0: fold the inbox with `gather` starting from
//!   `gather_init`, `apply` it, and go INACTIVE (after `save_output`) when
//!   the value is close to the previous one, ACTIVE otherwise
//! - every iteration: `scatter` the value to every out edge for `i + 1`

use crate::error::Result;
use crate::filter::VertexProgram;

use super::graph::{GroupAccess, VertexState};

/// Fixed-width value carried in vertex message payloads (little-endian).
pub trait GasValue: Copy + PartialEq + Send + 'static {
    fn to_payload(self) -> Vec<u8>;
    fn from_payload(bytes: &[u8]) -> Option<Self>;
}

macro_rules! gas_value_le {
    ($($t:ty),*) => {
        $(
            impl GasValue for $t {
                fn to_payload(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_payload(bytes: &[u8]) -> Option<Self> {
                    bytes.try_into().ok().map(<$t>::from_le_bytes)
                }
            }
        )*
    };
}

gas_value_le!(u64, i64, f64);

pub trait GasProgram: Send + 'static {
    /// Value sent along edges.
    type Msg: GasValue;
    /// Value held by the vertex.
    type Value: GasValue;

    fn gather(&self, a: Self::Msg, b: Self::Msg) -> Self::Msg;

    fn apply(&self, value: Self::Value, gathered: Self::Msg) -> Self::Value;

    fn scatter(&self, value: Self::Value) -> Self::Msg;

    fn gather_init(&self, access: &GroupAccess<'_>) -> Self::Msg;

    /// Initial vertex value; may create the vertex's output entry.
    fn init(&mut self, access: &mut GroupAccess<'_>) -> Result<Self::Value>;

    fn save_output(&mut self, access: &mut GroupAccess<'_>, value: Self::Value) -> Result<()>;

    fn is_close(&self, a: Self::Value, b: Self::Value) -> bool {
        a == b
    }
}

pub struct GasVertex<P: GasProgram> {
    program: P,
    value: Option<P::Value>,
}

impl<P: GasProgram> GasVertex<P> {
    pub fn new(program: P) -> Self {
        Self { program, value: None }
    }

    pub fn value(&self) -> Option<P::Value> {
        self.value
    }
}

impl<P: GasProgram> VertexProgram for GasVertex<P> {
    fn run(&mut self, access: &mut GroupAccess<'_>) -> Result<()> {
        let mut value = match self.value {
            Some(value) => value,
            None => self.program.init(access)?,
        };

        if access.iter() > 0 {
            let mut gathered = self.program.gather_init(access);
            for payload in access.inbox() {
                match P::Msg::from_payload(payload) {
                    Some(msg) => gathered = self.program.gather(msg, gathered),
                    None => tracing::warn!(
                        vertex = %access.key(),
                        len = payload.len(),
                        "dropping malformed vertex message"
                    ),
                }
            }

            let previous = value;
            value = self.program.apply(value, gathered);
            if self.program.is_close(previous, value) {
                self.program.save_output(access, value)?;
                access.set_state(VertexState::Inactive);
            } else {
                access.set_state(VertexState::Active);
            }
        } else {
            access.set_state(VertexState::Active);
        }
        self.value = Some(value);

        let payload = self.program.scatter(value).to_payload();
        for edge in access.out_edges() {
            access.send(edge.target, payload.clone());
        }
        Ok(())
    }
}
