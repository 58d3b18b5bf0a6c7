pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Project and database the client is synchronizing with. Used to build and
/// parse fully qualified resource names on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_uses_default_database() {
        let id = DatabaseId::default("project");
        assert_eq!(id.database(), DEFAULT_DATABASE_ID);
        assert_eq!(id.database_name(), "projects/project/databases/(default)");
    }
}
