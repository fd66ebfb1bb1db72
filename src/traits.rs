use crate::error::VhdError;
use crate::Result;

pub trait ReadAt {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    fn read_exact_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let mut buffer = buffer;
        while !buffer.is_empty() {
            match self.read_at(offset, buffer) {
                Ok(0) => break, // EOF
                Ok(n) => buffer = &mut buffer[n..],
                Err(e) => return Err(e),
            }
        }

        if buffer.is_empty() {
            Ok(())
        } else {
            Err(VhdError::UnexpectedEod)
        }
    }
}

pub trait WriteAt {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;

    fn write_all_at(&self, offset: u64, data: &[u8]) -> Result<()> {        
        let mut offset = offset;
        let mut data = data;
        while !data.is_empty() {
            match self.write_at(offset, data) {
                Ok(0) => {
                    return Err(VhdError::WriteZero);
                }
                Ok(n) => {
                    data = &data[n..];
                    offset += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub trait Flush {
    fn flush(&self) -> Result<()>;
}