pub mod supabase;

pub use supabase::{SupabaseClient, SESSION_FILE};
