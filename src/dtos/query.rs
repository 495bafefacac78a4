//! Query DTOs - Data Transfer Objects per query di paginazione

use crate::sync::Cursor;
use serde::{Deserialize, Serialize};

/// DTO per query parameters di paginazione (messaggi e lista conversazioni)
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PageQuery {
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PageQuery {
    /// Dimensione di pagina effettiva: default se assente, limitata a `max`.
    /// Lo zero passa così com'è e viene rifiutato dal paginatore.
    pub fn page_size(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).min(max)
    }
}
