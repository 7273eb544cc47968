pub mod room_repository_sqlx;

pub use room_repository_sqlx::SqlxRoomRepository;
