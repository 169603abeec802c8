use memflow::prelude::v1::*;

use dataview::DataView;

/// Raw kernel virtual memory.
///
/// The session only ever needs "read these bytes at this address", so this
/// is the one seam between the reconstruction code and memflow.
pub trait KernelMemory {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    fn read_u64(&mut self, addr: Address) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_raw_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i32(&mut self, addr: Address) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_raw_into(addr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Reads an integer of `size` bytes, zero extended.
    fn read_uint(&mut self, addr: Address, size: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        let size = size.min(buf.len());
        self.read_raw_into(addr, &mut buf[..size])?;

        let view = DataView::from(&buf[..]);
        view.try_read::<u64>(0)
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArgument))
    }

    /// Reads an integer of `size` bytes, sign extended.
    fn read_int(&mut self, addr: Address, size: usize) -> Result<i64> {
        let raw = self.read_uint(addr, size)?;
        Ok(match size {
            1 => raw as u8 as i8 as i64,
            2 => raw as u16 as i16 as i64,
            4 => raw as u32 as i32 as i64,
            _ => raw as i64,
        })
    }
}

impl<T: KernelMemory + ?Sized> KernelMemory for Box<T> {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        (**self).read_raw_into(addr, out)
    }
}

/// Adapts any memflow virtual memory view, such as a `VirtualDma` over a
/// `kcore` or coredump connector.
pub struct ViewMemory<V>(pub V);

impl<V: MemoryView> KernelMemory for ViewMemory<V> {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        self.0.read_raw_into(addr, out).data_part()
    }
}
