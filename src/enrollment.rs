use crate::model::{CoreError, Scope, Subject, Subtype};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Full replacement field set for a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFields {
    pub name: String,
    pub class_id: String,
    pub teacher_id: Option<String>,
    pub department: String,
    pub subtype: Subtype,
    pub batch_ids: Vec<String>,
}

impl SubjectFields {
    /// Accepts both the current keys (`classId`, `teacherId`, `subType`) and the
    /// older form keys (`class`, `teacher`, `type`).
    pub fn from_params(params: &serde_json::Value) -> Result<Self, CoreError> {
        let str_field = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| params.get(*k).and_then(|v| v.as_str()))
                .map(|s| s.trim().to_string())
        };

        let name = str_field(&["name"]).unwrap_or_default();
        if name.is_empty() {
            return Err(CoreError::bad_params("missing name"));
        }
        let class_id = str_field(&["classId", "class"]).unwrap_or_default();
        if class_id.is_empty() {
            return Err(CoreError::bad_params("missing classId"));
        }
        let teacher_id = str_field(&["teacherId", "teacher"]).filter(|s| !s.is_empty());
        let department = str_field(&["department"]).unwrap_or_default();

        let raw_type = str_field(&["subType", "type"])
            .ok_or_else(|| CoreError::bad_params("missing subType"))?;
        let subtype = Subtype::parse(&raw_type).ok_or_else(|| {
            CoreError::bad_params("subType must be one of: theory, practical, tg")
                .with_details(json!({ "subType": raw_type }))
        })?;

        let mut batch_ids: Vec<String> = Vec::new();
        if subtype.scope() == Scope::Batches {
            let raw = params.get("batchIds").and_then(|v| v.as_array());
            for v in raw.into_iter().flatten() {
                let Some(s) = v.as_str() else {
                    return Err(CoreError::bad_params("batchIds must be strings"));
                };
                let s = s.trim();
                if !s.is_empty() && !batch_ids.iter().any(|b| b == s) {
                    batch_ids.push(s.to_string());
                }
            }
            if batch_ids.is_empty() {
                return Err(CoreError::bad_params(format!(
                    "{} subjects need at least one batch",
                    subtype.as_str()
                )));
            }
        }

        Ok(SubjectFields {
            name,
            class_id,
            teacher_id,
            department,
            subtype,
            batch_ids,
        })
    }
}

/// Resolved membership of one subject at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure {
    pub class_id: Option<String>,
    pub teacher_id: Option<String>,
    pub students: BTreeSet<String>,
}

/// Every back-reference change one subject mutation implies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipPlan {
    pub class_remove: Option<String>,
    pub class_add: Option<String>,
    pub students_remove: BTreeSet<String>,
    pub students_add: BTreeSet<String>,
    pub faculty_remove: Option<String>,
    pub faculty_add: Option<String>,
}

impl MembershipPlan {
    pub fn between(old: &Closure, new: &Closure) -> Self {
        let (class_remove, class_add) = if old.class_id == new.class_id {
            (None, None)
        } else {
            (old.class_id.clone(), new.class_id.clone())
        };
        let (faculty_remove, faculty_add) = if old.teacher_id == new.teacher_id {
            (None, None)
        } else {
            (old.teacher_id.clone(), new.teacher_id.clone())
        };
        MembershipPlan {
            class_remove,
            class_add,
            students_remove: old.students.difference(&new.students).cloned().collect(),
            students_add: new.students.difference(&old.students).cloned().collect(),
            faculty_remove,
            faculty_add,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.class_remove.is_none()
            && self.class_add.is_none()
            && self.students_remove.is_empty()
            && self.students_add.is_empty()
            && self.faculty_remove.is_none()
            && self.faculty_add.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectChange {
    pub subject: Subject,
    pub membership: MembershipPlan,
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, CoreError> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, CoreError> {
    exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id)
}

pub fn faculty_exists(conn: &Connection, faculty_id: &str) -> Result<bool, CoreError> {
    exists(conn, "SELECT 1 FROM faculty WHERE id = ?", faculty_id)
}

fn load_batch_ids(conn: &Connection, subject_id: &str) -> Result<Vec<String>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT batch_id FROM subject_batches WHERE subject_id = ? ORDER BY sort_order",
    )?;
    let ids = stmt
        .query_map([subject_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> Result<Option<Subject>, CoreError> {
    let row = conn
        .query_row(
            "SELECT id, name, class_id, teacher_id, department, sub_type
             FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((id, name, class_id, teacher_id, department, sub_type)) = row else {
        return Ok(None);
    };
    let sub_type = Subtype::parse(&sub_type).ok_or_else(|| {
        CoreError::new("db_corrupt", format!("subject {} has unknown subType", id))
            .with_details(json!({ "subType": sub_type }))
    })?;
    let batch_ids = load_batch_ids(conn, &id)?;
    Ok(Some(Subject {
        id,
        name,
        class_id,
        teacher_id,
        department,
        sub_type,
        batch_ids,
    }))
}

pub fn list_subjects(conn: &Connection) -> Result<Vec<Subject>, CoreError> {
    let mut stmt = conn.prepare("SELECT id FROM subjects ORDER BY name, id")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(s) = load_subject(conn, &id)? {
            out.push(s);
        }
    }
    Ok(out)
}

fn class_students(conn: &Connection, class_id: &str) -> Result<BTreeSet<String>, CoreError> {
    let mut stmt = conn.prepare("SELECT id FROM students WHERE class_id = ?")?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

/// Union of the listed batches' students. Batches outside the class contribute nothing.
fn batch_students(
    conn: &Connection,
    class_id: &str,
    batch_ids: &[String],
) -> Result<BTreeSet<String>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT bs.student_id
         FROM batch_students bs
         JOIN batches b ON b.id = bs.batch_id
         WHERE b.class_id = ? AND b.id = ?",
    )?;
    let mut out = BTreeSet::new();
    for batch_id in batch_ids {
        let ids = stmt
            .query_map((class_id, batch_id), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        out.extend(ids);
    }
    Ok(out)
}

pub fn resolve_closure(
    conn: &Connection,
    class_id: &str,
    teacher_id: Option<&str>,
    subtype: Subtype,
    batch_ids: &[String],
) -> Result<Closure, CoreError> {
    let students = match subtype.scope() {
        Scope::Class => class_students(conn, class_id)?,
        Scope::Batches => batch_students(conn, class_id, batch_ids)?,
    };
    Ok(Closure {
        class_id: Some(class_id.to_string()),
        teacher_id: teacher_id.map(|s| s.to_string()),
        students,
    })
}

pub fn subject_closure(conn: &Connection, subject: &Subject) -> Result<Closure, CoreError> {
    resolve_closure(
        conn,
        &subject.class_id,
        subject.teacher_id.as_deref(),
        subject.sub_type,
        &subject.batch_ids,
    )
}

pub fn apply_plan(
    conn: &Connection,
    subject_id: &str,
    plan: &MembershipPlan,
) -> Result<(), CoreError> {
    if let Some(class_id) = &plan.class_remove {
        conn.execute(
            "DELETE FROM class_subjects WHERE class_id = ? AND subject_id = ?",
            (class_id, subject_id),
        )
        .map_err(|e| CoreError::store("db_update_failed", e, "class_subjects"))?;
    }
    if let Some(class_id) = &plan.class_add {
        conn.execute(
            "INSERT OR IGNORE INTO class_subjects(class_id, subject_id) VALUES(?, ?)",
            (class_id, subject_id),
        )
        .map_err(|e| CoreError::store("db_update_failed", e, "class_subjects"))?;
    }

    if !plan.students_remove.is_empty() {
        let mut pull = conn
            .prepare("DELETE FROM student_subjects WHERE student_id = ? AND subject_id = ?")?;
        for student_id in &plan.students_remove {
            pull.execute((student_id, subject_id))
                .map_err(|e| CoreError::store("db_update_failed", e, "student_subjects"))?;
        }
    }
    if !plan.students_add.is_empty() {
        let mut push = conn.prepare(
            "INSERT OR IGNORE INTO student_subjects(student_id, subject_id) VALUES(?, ?)",
        )?;
        for student_id in &plan.students_add {
            push.execute((student_id, subject_id))
                .map_err(|e| CoreError::store("db_update_failed", e, "student_subjects"))?;
        }
    }

    if let Some(faculty_id) = &plan.faculty_remove {
        conn.execute(
            "DELETE FROM faculty_subjects WHERE faculty_id = ? AND subject_id = ?",
            (faculty_id, subject_id),
        )
        .map_err(|e| CoreError::store("db_update_failed", e, "faculty_subjects"))?;
    }
    if let Some(faculty_id) = &plan.faculty_add {
        conn.execute(
            "INSERT OR IGNORE INTO faculty_subjects(faculty_id, subject_id) VALUES(?, ?)",
            (faculty_id, subject_id),
        )
        .map_err(|e| CoreError::store("db_update_failed", e, "faculty_subjects"))?;
    }
    Ok(())
}

fn write_subject_batches(
    conn: &Connection,
    subject_id: &str,
    batch_ids: &[String],
) -> Result<(), CoreError> {
    conn.execute(
        "DELETE FROM subject_batches WHERE subject_id = ?",
        [subject_id],
    )
    .map_err(|e| CoreError::store("db_delete_failed", e, "subject_batches"))?;
    let mut stmt = conn.prepare(
        "INSERT INTO subject_batches(subject_id, batch_id, sort_order) VALUES(?, ?, ?)",
    )?;
    for (i, batch_id) in batch_ids.iter().enumerate() {
        stmt.execute((subject_id, batch_id, i as i64))
            .map_err(|e| CoreError::store("db_insert_failed", e, "subject_batches"))?;
    }
    Ok(())
}

fn check_references(conn: &Connection, fields: &SubjectFields) -> Result<(), CoreError> {
    if !class_exists(conn, &fields.class_id)? {
        return Err(CoreError::not_found("class not found")
            .with_details(json!({ "classId": fields.class_id })));
    }
    if let Some(teacher_id) = &fields.teacher_id {
        if !faculty_exists(conn, teacher_id)? {
            return Err(CoreError::not_found("faculty not found")
                .with_details(json!({ "teacherId": teacher_id })));
        }
    }
    Ok(())
}

fn fields_into_subject(id: String, fields: SubjectFields) -> Subject {
    Subject {
        id,
        name: fields.name,
        class_id: fields.class_id,
        teacher_id: fields.teacher_id,
        department: fields.department,
        sub_type: fields.subtype,
        batch_ids: fields.batch_ids,
    }
}

fn begin(conn: &Connection) -> Result<rusqlite::Transaction<'_>, CoreError> {
    conn.unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))
}

fn commit(tx: rusqlite::Transaction<'_>) -> Result<(), CoreError> {
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))
}

pub fn create_subject(
    conn: &Connection,
    requested_id: Option<String>,
    fields: SubjectFields,
) -> Result<SubjectChange, CoreError> {
    check_references(conn, &fields)?;
    let subject_id = requested_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if load_subject(conn, &subject_id)?.is_some() {
        return Err(CoreError::new("conflict", "subject already exists")
            .with_details(json!({ "subjectId": subject_id })));
    }

    let tx = begin(conn)?;
    tx.execute(
        "INSERT INTO subjects(id, name, class_id, teacher_id, department, sub_type)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &fields.name,
            &fields.class_id,
            &fields.teacher_id,
            &fields.department,
            fields.subtype.as_str(),
        ),
    )
    .map_err(|e| CoreError::store("db_insert_failed", e, "subjects"))?;
    write_subject_batches(&tx, &subject_id, &fields.batch_ids)?;

    let subject = fields_into_subject(subject_id, fields);
    let new = subject_closure(&tx, &subject)?;
    let plan = MembershipPlan::between(&Closure::default(), &new);
    apply_plan(&tx, &subject.id, &plan)?;
    commit(tx)?;

    info!(
        "subject created id={} class={} subType={} students={}",
        subject.id,
        subject.class_id,
        subject.sub_type.as_str(),
        plan.students_add.len()
    );
    Ok(SubjectChange {
        subject,
        membership: plan,
    })
}

pub fn update_subject(
    conn: &Connection,
    subject_id: &str,
    fields: SubjectFields,
) -> Result<SubjectChange, CoreError> {
    let Some(old_subject) = load_subject(conn, subject_id)? else {
        return Err(CoreError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id })));
    };
    check_references(conn, &fields)?;

    // The old closure must be captured before the subject row changes.
    let old = subject_closure(conn, &old_subject)?;

    let tx = begin(conn)?;
    tx.execute(
        "UPDATE subjects
         SET name = ?, class_id = ?, teacher_id = ?, department = ?, sub_type = ?
         WHERE id = ?",
        (
            &fields.name,
            &fields.class_id,
            &fields.teacher_id,
            &fields.department,
            fields.subtype.as_str(),
            subject_id,
        ),
    )
    .map_err(|e| CoreError::store("db_update_failed", e, "subjects"))?;
    write_subject_batches(&tx, subject_id, &fields.batch_ids)?;

    let subject = fields_into_subject(subject_id.to_string(), fields);
    let new = subject_closure(&tx, &subject)?;
    let plan = MembershipPlan::between(&old, &new);
    apply_plan(&tx, subject_id, &plan)?;
    commit(tx)?;

    info!(
        "subject updated id={} added={} removed={} classMoved={} teacherChanged={}",
        subject_id,
        plan.students_add.len(),
        plan.students_remove.len(),
        plan.class_add.is_some(),
        plan.faculty_add.is_some() || plan.faculty_remove.is_some()
    );
    Ok(SubjectChange {
        subject,
        membership: plan,
    })
}

pub fn delete_subject(conn: &Connection, subject_id: &str) -> Result<SubjectChange, CoreError> {
    let Some(subject) = load_subject(conn, subject_id)? else {
        return Err(CoreError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id })));
    };
    let old = subject_closure(conn, &subject)?;
    let plan = MembershipPlan::between(&old, &Closure::default());

    let tx = begin(conn)?;
    apply_plan(&tx, subject_id, &plan)?;
    // Sweep back-references that drifted outside the closure.
    for (table, sql) in [
        ("student_subjects", "DELETE FROM student_subjects WHERE subject_id = ?"),
        ("class_subjects", "DELETE FROM class_subjects WHERE subject_id = ?"),
        ("faculty_subjects", "DELETE FROM faculty_subjects WHERE subject_id = ?"),
        ("subject_batches", "DELETE FROM subject_batches WHERE subject_id = ?"),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ] {
        tx.execute(sql, [subject_id])
            .map_err(|e| CoreError::store("db_delete_failed", e, table))?;
    }
    commit(tx)?;

    info!(
        "subject deleted id={} studentsReleased={}",
        subject_id,
        plan.students_remove.len()
    );
    Ok(SubjectChange {
        subject,
        membership: plan,
    })
}

pub fn class_subject_ids(conn: &Connection, class_id: &str) -> Result<Vec<String>, CoreError> {
    let mut stmt = conn.prepare("SELECT id FROM subjects WHERE class_id = ? ORDER BY id")?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn batch_subject_ids(conn: &Connection, batch_id: &str) -> Result<Vec<String>, CoreError> {
    let mut stmt =
        conn.prepare("SELECT subject_id FROM subject_batches WHERE batch_id = ? ORDER BY subject_id")?;
    let ids = stmt
        .query_map([batch_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Captures current closures ahead of a roster change.
pub fn snapshot_subjects(
    conn: &Connection,
    subject_ids: &[String],
) -> Result<Vec<(Subject, Closure)>, CoreError> {
    let mut out = Vec::with_capacity(subject_ids.len());
    for id in subject_ids {
        if let Some(subject) = load_subject(conn, id)? {
            let closure = subject_closure(conn, &subject)?;
            out.push((subject, closure));
        }
    }
    Ok(out)
}

/// Reapplies each snapshotted subject's closure after a roster change.
/// Returns the number of student links added or removed.
pub fn resync_subjects(
    conn: &Connection,
    snapshots: &[(Subject, Closure)],
) -> Result<usize, CoreError> {
    let mut changed = 0;
    for (subject, old) in snapshots {
        let new = subject_closure(conn, subject)?;
        let plan = MembershipPlan::between(old, &new);
        if plan.is_empty() {
            continue;
        }
        debug!(
            "resync subject={} added={} removed={}",
            subject.id,
            plan.students_add.len(),
            plan.students_remove.len()
        );
        apply_plan(conn, &subject.id, &plan)?;
        changed += plan.students_add.len() + plan.students_remove.len();
    }
    Ok(changed)
}
