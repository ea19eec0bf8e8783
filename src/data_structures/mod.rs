mod bitmap;
mod block_map;
mod id;

pub use bitmap::Bitmap;
pub use block_map::BlockMap;
pub use id::{ID, ID_LEN};
