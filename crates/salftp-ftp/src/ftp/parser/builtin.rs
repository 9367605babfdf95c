//! Server types shipped with the client.

use lazy_static::lazy_static;

use super::ast::{ColumnDef, ColumnKind};
use super::ServerType;

const NOT_OTHER_SYSTEMS: &str = r#"not syst_contains("z/VM ") and not syst_contains("OS/2 ") and not syst_contains(" MACOS ") and not syst_contains("Windows_NT")"#;

const UNIX_RULES: &str = r##"# files and directories
* if(next_char!="l"), assign(<is_dir>, next_char=="d"), word(<rights>),
  white_spaces(), word(), white_spaces(), word(<user>), white_spaces(),
  word(<group>), white_spaces(), positive_number(<size>), white_spaces(),
  month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year(<date>), white_spaces(2),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

* if(next_char!="l"), assign(<is_dir>, next_char=="d"), word(<rights>),
  white_spaces(), word(), white_spaces(), word(<user>), white_spaces(),
  word(<group>), white_spaces(), positive_number(<size>), white_spaces(),
  month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year_or_time(<date>, <time>), white_spaces(1),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

# links
* if(next_char=="l"), assign(<is_link>, true), word(<rights>), white_spaces(),
  word(), white_spaces(), word(<user>), white_spaces(), word(<group>),
  white_spaces(), word(), white_spaces(),
  month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year(<date>), white_spaces(2),
  assign(<is_hidden>, next_char=="."), unix_link(<is_dir>, <name>, <link>);

* if(next_char=="l"), assign(<is_link>, true), word(<rights>), white_spaces(),
  word(), white_spaces(), word(<user>), white_spaces(), word(<group>),
  white_spaces(), word(), white_spaces(),
  month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year_or_time(<date>, <time>), white_spaces(1),
  assign(<is_hidden>, next_char=="."), unix_link(<is_dir>, <name>, <link>);

# devices
* word(<rights>), white_spaces(), word(), white_spaces(), word(<user>),
  white_spaces(), word(<group>), white_spaces(), unix_device(<device>),
  white_spaces(), month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year(<date>), white_spaces(2),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

* word(<rights>), white_spaces(), word(), white_spaces(), word(<user>),
  white_spaces(), word(<group>), white_spaces(), unix_device(<device>),
  white_spaces(), month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year_or_time(<date>, <time>), white_spaces(1),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

# files and directories, user and group containing spaces
* if(next_char!="l"), assign(<is_dir>, next_char=="d"), word(<rights>),
  white_spaces(), word(), skip_to_number(), positive_number(<size>),
  white_spaces(), month_3(<date>), white_spaces(), day(<date>),
  white_spaces(), year(<date>), white_spaces(2),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

* if(next_char!="l"), assign(<is_dir>, next_char=="d"), word(<rights>),
  white_spaces(), word(), skip_to_number(), positive_number(<size>),
  white_spaces(), month_3(<date>), white_spaces(), day(<date>), white_spaces(),
  year_or_time(<date>, <time>), white_spaces(1),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

# links, user and group containing spaces
* if(next_char=="l"), assign(<is_link>, true), word(<rights>), white_spaces(),
  word(), skip_to_number(), word(), white_spaces(), month_3(<date>),
  white_spaces(), day(<date>), white_spaces(), year(<date>), white_spaces(2),
  assign(<is_hidden>, next_char=="."), unix_link(<is_dir>, <name>, <link>);

* if(next_char=="l"), assign(<is_link>, true), word(<rights>), white_spaces(),
  word(), skip_to_number(), word(), white_spaces(), month_3(<date>),
  white_spaces(), day(<date>), white_spaces(), year_or_time(<date>, <time>),
  white_spaces(1), assign(<is_hidden>, next_char=="."),
  unix_link(<is_dir>, <name>, <link>);

# devices, user and group containing spaces
* word(<rights>), white_spaces(), word(), skip_to_number(),
  unix_device(<device>), white_spaces(), month_3(<date>), white_spaces(),
  day(<date>), white_spaces(), year(<date>), white_spaces(2),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

* word(<rights>), white_spaces(), word(), skip_to_number(),
  unix_device(<device>), white_spaces(), month_3(<date>), white_spaces(),
  day(<date>), white_spaces(), year_or_time(<date>, <time>), white_spaces(1),
  assign(<is_hidden>, next_char=="."), rest_of_line(<name>);

# "total 1234" header, up to three words
* if(first_nonempty_line), skip_white_spaces(), word(), skip_white_spaces();
* if(first_nonempty_line), skip_white_spaces(), word(), skip_white_spaces(),
  word(), skip_white_spaces();
* if(first_nonempty_line), skip_white_spaces(), word(), skip_white_spaces(),
  word(), skip_white_spaces(), word(), skip_white_spaces();

# empty lines
* skip_white_spaces();
"##;

const NETWARE_RULES: &str = r##"# Netware FTP server
* assign(<is_dir>, next_char=="d"), all(1), white_spaces(1), all_to("["),
  all_up_to(<rights>, "]"), white_spaces(1), all(<user>, 28),
  cut_white_spaces_end(<user>), white_spaces(), positive_number(<size>),
  white_spaces(), month_3(<date>), white_spaces(), day(<date>),
  white_spaces(), year_or_time(<date>, <time>), white_spaces(1),
  rest_of_line(<name>);

# Hellsoft FTP server
* assign(<is_dir>, next_char=="d"), all_to("["), all_up_to(<rights>, "]"),
  white_spaces(), word(), white_spaces(), word(<user>),
  white_spaces(), positive_number(<size>), white_spaces(), month_3(<date>),
  white_spaces(), day(<date>), white_spaces(),
  year_or_time(<date>, <time>), white_spaces(1), rest_of_line(<name>);

# "total ???" or "--- listing ---" header, up to three words
* if(first_nonempty_line), skip_white_spaces(), word(), skip_white_spaces();
* if(first_nonempty_line), skip_white_spaces(), word(), skip_white_spaces(),
  word(), skip_white_spaces();
* if(first_nonempty_line), skip_white_spaces(), word(), skip_white_spaces(),
  word(), skip_white_spaces(), word(), skip_white_spaces();

* skip_white_spaces();
"##;

const IIS_RULES: &str = r##"# files
* month(<date>), all(1), day(<date>), all(1), year(<date>), white_spaces(),
  time(<time>), white_spaces(), positive_number(<size>), white_spaces(),
  rest_of_line(<name>);

# directories
* month(<date>), all(1), day(<date>), all(1), year(<date>), white_spaces(),
  time(<time>), white_spaces(), if(next_word eq "<dir>"), all(5),
  assign(<is_dir>, true), white_spaces(), rest_of_line(<name>);

# files without a name
* month(<date>), all(1), day(<date>), all(1), year(<date>), white_spaces(),
  time(<time>), white_spaces(), positive_number(<size>), white_spaces();

# directories without a name
* month(<date>), all(1), day(<date>), all(1), year(<date>), white_spaces(),
  time(<time>), white_spaces(), if(next_word eq "<dir>"), all(5),
  assign(<is_dir>, true), white_spaces();

* skip_white_spaces();
"##;

const OS2_RULES: &str = r##"# files and directories
* skip_white_spaces(), positive_number(<size>), white_spaces(1), all(<attrs>, 9),
  cut_white_spaces(<attrs>), white_spaces(1),
  assign(<is_dir>, next_word eq "DIR"), all(3), white_spaces(),
  month(<date>), all(1), day(<date>), all(1), year(<date>),
  white_spaces(), time(<time>), white_spaces(), rest_of_line(<name>);

* skip_white_spaces();
"##;

const VXWORKS_RULES: &str = r##"# directories
* skip_white_spaces(), positive_number(<size>), white_spaces(), month_3(<date>),
  all(1), day(<date>), all(1), year(<date>), white_spaces(), time(<time>),
  white_spaces(), all_up_to(<name>, "<"), cut_white_spaces_end(<name>),
  if(next_word eq "DIR>"), all(4), assign(<is_dir>, true), skip_white_spaces();

# files
* skip_white_spaces(), positive_number(<size>), white_spaces(), month_3(<date>),
  all(1), day(<date>), all(1), year(<date>), white_spaces(), time(<time>),
  white_spaces(), rest_of_line(<name>), cut_white_spaces_end(<name>),
  if("<" not_in <name>);

# "size date time ..." header
* if(first_nonempty_line), skip_white_spaces(), if (next_word eq "size"), word(),
  skip_white_spaces(), if (next_word eq "date"), word(), skip_white_spaces(),
  if (next_word eq "time"), rest_of_line();

# "--------  ------ ..." separator
* if("----" in next_word), rest_of_line();

* skip_white_spaces();
"##;

const TANDEM_RULES: &str = r##"# files
* word(<name>), white_spaces(), number(<code>), white_spaces(), positive_number(<size>),
  white_spaces(), day(<date>), all(1), month_3(<date>), all(1), year(<date>), white_spaces(),
  time(<time>), white_spaces(), all_up_to(<user>, "\""), cut_white_spaces_end(<user>),
  all_up_to(<RWEP>, "\"");

# "File Code EOF ..." header
* if(first_nonempty_line), skip_white_spaces(), if (next_word eq "file"), word(),
  skip_white_spaces(), if (next_word eq "code"), word(), skip_white_spaces(),
  if (next_word eq "eof"), rest_of_line();

* skip_white_spaces();
"##;

fn columns(defs: &[(&str, ColumnKind)]) -> Vec<ColumnDef> {
    defs.iter().map(|(id, kind)| ColumnDef::new(id, *kind)).collect()
}

fn builtin_types() -> Vec<ServerType> {
    use ColumnKind::*;
    vec![
        ServerType {
            name: "UNIX".into(),
            autodetect: Some(NOT_OTHER_SYSTEMS.into()),
            columns: columns(&[
                ("name", Name),
                ("ext", Ext),
                ("size", Size),
                ("type", Type),
                ("date", Date),
                ("time", Time),
                ("rights", Text),
                ("link", Text),
                ("user", Text),
                ("group", Text),
                ("device", Text),
            ]),
            rules: UNIX_RULES.into(),
        },
        ServerType {
            name: "Netware".into(),
            autodetect: Some(NOT_OTHER_SYSTEMS.into()),
            columns: columns(&[
                ("name", Name),
                ("ext", Ext),
                ("size", Size),
                ("type", Type),
                ("date", Date),
                ("time", Time),
                ("rights", Text),
                ("user", Text),
            ]),
            rules: NETWARE_RULES.into(),
        },
        ServerType {
            name: "Microsoft IIS".into(),
            autodetect: None,
            columns: columns(&[
                ("name", Name),
                ("ext", Ext),
                ("size", Size),
                ("type", Type),
                ("date", Date),
                ("time", Time),
            ]),
            rules: IIS_RULES.into(),
        },
        ServerType {
            name: "OS/2".into(),
            autodetect: None,
            columns: columns(&[
                ("name", Name),
                ("ext", Ext),
                ("size", Size),
                ("type", Type),
                ("date", Date),
                ("time", Time),
                ("attrs", Text),
            ]),
            rules: OS2_RULES.into(),
        },
        ServerType {
            name: "VxWorks".into(),
            autodetect: Some(r#"welcome_contains(" VxWorks ")"#.into()),
            columns: columns(&[
                ("name", Name),
                ("ext", Ext),
                ("size", Size),
                ("type", Type),
                ("date", Date),
                ("time", Time),
            ]),
            rules: VXWORKS_RULES.into(),
        },
        ServerType {
            name: "Tandem".into(),
            autodetect: None,
            columns: columns(&[
                ("name", Name),
                ("code", Number),
                ("size", Size),
                ("date", Date),
                ("time", Time),
                ("user", Text),
                ("RWEP", Text),
            ]),
            rules: TANDEM_RULES.into(),
        },
    ]
}

lazy_static! {
    /// Built-in server types in autodetect order.
    pub static ref BUILTIN_SERVER_TYPES: Vec<ServerType> = builtin_types();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_type_compiles() {
        for ty in BUILTIN_SERVER_TYPES.iter() {
            let compiled = ty.compile();
            assert!(compiled.is_ok(), "{}: {:?}", ty.name, compiled.err());
        }
    }
}
