//! T-SQL batches for managing a tenant's SQL Server and its databases.
//!
//! `CREATE LOGIN` does not accept a parameter for the password, so the
//! password is embedded as an N'' literal with single quotes doubled.
//! Identifiers are bracket-quoted.

use daas_protocol::Parameter;

pub const DATABASE_NAME_PARAMETER: &str = "DatabaseName";

fn identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn literal(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn configure_server_memory(max_memory_mb: u32) -> Vec<String> {
    vec![
        "Use [master];".to_string(),
        "Exec sys.sp_configure N'show advanced options', N'1'\n    Reconfigure With Override;"
            .to_string(),
        format!(
            "Exec sys.sp_configure N'max server memory (MB)', N'{max_memory_mb}'\n    Reconfigure With Override;"
        ),
        "Exec sys.sp_configure N'show advanced options', N'0'\n    Reconfigure With Override;"
            .to_string(),
    ]
}

/// Query returning one row per database named `@DatabaseName`.
pub fn check_database_exists(database_name: &str) -> (Vec<String>, Vec<Parameter>) {
    (
        vec![format!(
            "Select name from sys.databases Where name = @{DATABASE_NAME_PARAMETER}"
        )],
        vec![Parameter::nvarchar(
            DATABASE_NAME_PARAMETER,
            50,
            database_name,
        )],
    )
}

pub fn create_database(database_name: &str, user_name: &str, password: &str) -> Vec<String> {
    let db = identifier(database_name);
    let file_name = literal(database_name);
    let user = identifier(user_name);
    let password = literal(password);
    vec![
        format!(
            "Create Database {db}\n\
             On Primary\n\
             (\n    Name = N'{file_name}',\n    FileName = N'/var/opt/mssql/data/{file_name}.mdf',\n    Size = 8192KB,\n    FileGrowth = 65536KB\n)\n\
             Log On\n\
             (\n    Name = N'{file_name}_log',\n    FileName = N'/var/opt/mssql/data/{file_name}_log.ldf',\n    Size = 8192KB,\n    FileGrowth = 65536KB\n)"
        ),
        format!("Use {db}"),
        format!(
            "If Not Exists\n\
             (\n    Select name\n    From sys.filegroups\n    Where is_default=1 And name = N'PRIMARY'\n)\n\
             Begin\n    Alter Database {db}\n    Modify FileGroup [PRIMARY] Default\nEnd"
        ),
        "Use [master]".to_string(),
        format!(
            "Create Login {user}\n\
             With\n    Password=N'{password}',\n    DEFAULT_DATABASE={db},\n    CHECK_EXPIRATION=OFF,\n    CHECK_POLICY=ON"
        ),
        format!("Use {db}"),
        format!("Create User {user}\n    For Login {user}"),
    ]
}

pub fn drop_database(database_name: &str) -> Vec<String> {
    let db = identifier(database_name);
    vec![
        format!("Alter Database\n    {db}\nSet\n    SINGLE_USER With Rollback Immediate"),
        format!("Drop Database {db}"),
    ]
}
