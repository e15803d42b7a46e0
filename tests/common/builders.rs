//! Test data builders for creating test objects

use corrflow::{
    buffer::{Buffer, ElementType, FieldHandle},
    concurrency::{ConcurrencyManager, Direction, IoMode},
    channel::{ChannelTag, TagAllocator},
    transport::LoopbackTransport,
};
use std::sync::Arc;

/// Builder for test Buffer layouts
pub struct BufferBuilder {
    name: String,
    type_tag: u32,
    version: u16,
    variable: bool,
    fields: Vec<(String, ElementType, usize)>,
}

impl BufferBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: 0x42,
            version: 1,
            variable: false,
            fields: Vec::new(),
        }
    }

    pub fn type_tag(mut self, type_tag: u32) -> Self {
        self.type_tag = type_tag;
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn variable_size(mut self) -> Self {
        self.variable = true;
        self
    }

    pub fn field(mut self, name: &str, element: ElementType, count: usize) -> Self {
        self.fields.push((name.to_string(), element, count));
        self
    }

    /// Unallocated layout
    pub fn build(self) -> Buffer {
        let mut buffer =
            Buffer::new(self.name, self.type_tag, self.version).with_variable_size(self.variable);
        for (name, element, count) in self.fields {
            buffer.add_field(name, element, count).unwrap();
        }
        buffer
    }
}

/// Layout used by most integration tests: 64 i16 samples
pub fn sample_layout() -> (Buffer, FieldHandle) {
    let buffer = BufferBuilder::new("beamlets")
        .field("samples", ElementType::I16, 64)
        .build();
    let handle = buffer.field_handle("samples").unwrap();
    (buffer, handle)
}

/// A manager with an output channel looped back into an input channel.
pub struct LoopbackLink {
    pub manager: ConcurrencyManager,
    pub output: ChannelTag,
    pub input: ChannelTag,
    pub samples: FieldHandle,
}

impl LoopbackLink {
    pub fn new(output_mode: IoMode, input_mode: IoMode) -> Self {
        let (layout, samples) = sample_layout();
        let mut manager = ConcurrencyManager::new(Arc::new(TagAllocator::new()));
        let (tx, rx) = LoopbackTransport::pair();
        let output = manager
            .open(
                layout.clone_layout(),
                layout.clone_layout(),
                tx.into(),
                Direction::Output,
                output_mode,
            )
            .unwrap();
        let input = manager
            .open(
                layout.clone_layout(),
                layout.clone_layout(),
                rx.into(),
                Direction::Input,
                input_mode,
            )
            .unwrap();
        Self {
            manager,
            output,
            input,
            samples,
        }
    }

    /// Publish one message whose samples are all `value`.
    pub fn send(&mut self, value: i16) {
        let mut entry = self.manager.get_write_locked_buffer(self.output).unwrap();
        entry
            .buffer_mut()
            .unwrap()
            .write_field(self.samples, &[value; 64])
            .unwrap();
        self.manager.release(self.output, entry).unwrap();
    }

    /// Receive one message and return its first sample.
    pub fn recv(&mut self) -> i16 {
        let entry = self.manager.get_read_locked_buffer(self.input).unwrap();
        let value = entry.buffer().get::<i16>(self.samples, 0).unwrap();
        self.manager.release(self.input, entry).unwrap();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_builder() {
        let buffer = BufferBuilder::new("test")
            .type_tag(7)
            .version(3)
            .field("a", ElementType::F32, 4)
            .build();

        assert_eq!(buffer.name(), "test");
        assert_eq!(buffer.type_tag(), 7);
        assert_eq!(buffer.version(), 3);
        assert_eq!(buffer.field_count(), 1);
        assert!(!buffer.is_allocated());
    }
}
